// TCP transport for the transfer register
//
// Every register travels as 8 bytes in network (big-endian) order. A write
// request is followed by one frame; a read response is followed by one frame.
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};

use log::{debug, info, trace, warn};

use super::controller::Controller;
use super::opcode::{Command, Opcode};

/// Client side: forwards requests to a remote controller.
pub struct NetController {
    addr: String,
    stream: Option<TcpStream>,
}

impl NetController {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    fn connection(&mut self) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr)?;
            stream.set_nodelay(true)?;
            debug!("connected to controller at {}", self.addr);
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no controller connection")
        })
    }
}

impl Controller for NetController {
    fn bus_request(&mut self, register: u64, frame: Option<&mut [u8]>) -> io::Result<u64> {
        let command = Opcode::decode(register).command().ok();
        if matches!(command, Some(Command::RdFrme | Command::WrFrme)) && frame.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame command without a frame buffer",
            ));
        }

        let stream = self.connection()?;
        let res = exchange(stream, register, command, frame);
        if res.is_err() || command == Some(Command::PowOff) {
            debug!("closing controller connection");
            self.stream = None;
        }
        res
    }
}

fn exchange(
    stream: &mut TcpStream,
    register: u64,
    command: Option<Command>,
    frame: Option<&mut [u8]>,
) -> io::Result<u64> {
    stream.write_all(&register.to_be_bytes())?;
    trace!("sent {register:#018x}");

    match (command, frame) {
        (Some(Command::WrFrme), Some(buf)) => {
            stream.write_all(buf)?;
            read_register(stream)
        }
        (Some(Command::RdFrme), Some(buf)) => {
            let reply = read_register(stream)?;
            stream.read_exact(buf)?;
            Ok(reply)
        }
        _ => read_register(stream),
    }
}

fn read_register(stream: &mut TcpStream) -> io::Result<u64> {
    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw)?;
    let reply = u64::from_be_bytes(raw);
    trace!("received {reply:#018x}");
    Ok(reply)
}

/// Serve clients on `listener` forever, one connection at a time.
pub fn serve<C: Controller>(
    listener: &TcpListener,
    ctrl: &mut C,
    frame_size: usize,
) -> io::Result<()> {
    loop {
        serve_one(listener, ctrl, frame_size)?;
    }
}

/// Accept one client and answer its requests until it powers off or hangs up.
pub fn serve_one<C: Controller>(
    listener: &TcpListener,
    ctrl: &mut C,
    frame_size: usize,
) -> io::Result<()> {
    let (mut stream, peer) = listener.accept()?;
    info!("controller client {peer} connected");
    match session(&mut stream, ctrl, frame_size) {
        Ok(()) => info!("controller client {peer} done"),
        Err(e) => warn!("controller client {peer} dropped: {e}"),
    }
    Ok(())
}

fn session<C: Controller>(
    stream: &mut TcpStream,
    ctrl: &mut C,
    frame_size: usize,
) -> io::Result<()> {
    let mut frame = vec![0u8; frame_size];
    loop {
        let mut raw = [0u8; 8];
        match stream.read_exact(&mut raw) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let register = u64::from_be_bytes(raw);
        let command = Opcode::decode(register).command().ok();
        trace!("serving {register:#018x} ({command:?})");

        let reply = match command {
            Some(Command::WrFrme) => {
                stream.read_exact(&mut frame)?;
                ctrl.bus_request(register, Some(frame.as_mut_slice()))?
            }
            Some(Command::RdFrme) => {
                frame.fill(0);
                ctrl.bus_request(register, Some(frame.as_mut_slice()))?
            }
            _ => ctrl.bus_request(register, None)?,
        };

        stream.write_all(&reply.to_be_bytes())?;
        if command == Some(Command::RdFrme) {
            stream.write_all(&frame)?;
        }
        if command == Some(Command::PowOff) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::cart::controller::BusCounters;
    use crate::cart::{CartDriver, CartError, Geometry, MemoryController};

    fn geometry() -> Geometry {
        Geometry {
            frame_size: 32,
            frames_per_cartridge: 4,
            cartridges: 3,
            max_files: 4,
        }
    }

    /// Serve `sessions` client connections on a background thread.
    fn spawn_server(sessions: usize) -> (String, thread::JoinHandle<BusCounters>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind tcp");
        let addr = listener.local_addr().expect("local addr").to_string();
        let handle = thread::spawn(move || {
            let mut ctrl = MemoryController::new(geometry());
            for _ in 0..sessions {
                serve_one(&listener, &mut ctrl, geometry().frame_size).expect("serve");
            }
            ctrl.counters()
        });
        (addr, handle)
    }

    #[test]
    fn driver_round_trip_over_tcp() {
        let (addr, server) = spawn_server(1);
        let mut driver = CartDriver::new(NetController::new(addr), geometry()).unwrap();
        driver.set_cache_size(1).unwrap();
        driver.power_on().unwrap();

        let data: Vec<u8> = (0..200u32).map(|i| (i * 7) as u8).collect();
        let fd = driver.open("remote").unwrap();
        driver.write(fd, &data).unwrap();
        driver.seek(fd, 0).unwrap();
        assert_eq!(driver.read(fd, data.len()).unwrap(), data);
        driver.power_off().unwrap();

        let counters = server.join().unwrap();
        assert_eq!(counters.zeroes, 3);
        assert_eq!(counters.writes, 7);
        assert!(counters.reads >= 6);
    }

    #[test]
    fn reconnects_after_power_off() {
        let (addr, server) = spawn_server(2);
        let mut driver = CartDriver::new(NetController::new(addr), geometry()).unwrap();
        for _ in 0..2 {
            driver.power_on().unwrap();
            let fd = driver.open("a").unwrap();
            driver.write(fd, b"again").unwrap();
            driver.power_off().unwrap();
        }
        assert_eq!(server.join().unwrap().writes, 2);
    }

    #[test]
    fn remote_failure_flag_reaches_driver() {
        let (addr, server) = spawn_server(1);
        let mut ctrl = NetController::new(addr);
        // mounting before the media is initialized is refused
        let err = ctrl
            .execute(Opcode::request(Command::LdCart, 0, 0), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CartError::ControllerFailure {
                command: Command::LdCart,
                ..
            }
        ));
        ctrl.execute(Opcode::request(Command::PowOff, 0, 0), None)
            .unwrap_err();
        server.join().unwrap();
    }

    #[test]
    fn registers_travel_big_endian() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind tcp");
        let addr = listener.local_addr().expect("local addr").to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut raw = [0u8; 8];
            stream.read_exact(&mut raw).expect("read register");
            stream.write_all(&raw).expect("echo");
            raw
        });

        let register = Opcode::request(Command::LdCart, 0x0102, 0x0304)
            .encode()
            .unwrap();
        let mut ctrl = NetController::new(addr);
        assert_eq!(ctrl.bus_request(register, None).unwrap(), register);
        assert_eq!(server.join().unwrap(), register.to_be_bytes());
    }

    #[test]
    fn frame_commands_need_a_buffer() {
        let mut ctrl = NetController::new("127.0.0.1:1");
        let register = Opcode::request(Command::RdFrme, 0, 0).encode().unwrap();
        let err = ctrl.bus_request(register, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}

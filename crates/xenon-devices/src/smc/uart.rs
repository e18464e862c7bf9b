//! Pluggable UART backends.
//!
//! The SMC bridges the console's serial line to one of: nothing (`null`), a
//! TCP socket with optional stdout echo (`print`/`socket`), or a host
//! serial port (`vcom`, Windows only). Backends are constructed with their
//! transport parameters and armed by `init` with the guest's line
//! configuration word; a backend that reports `setup_needed` is
//! auto-initialized at `115200,8,N,1` the first time the guest touches the
//! status register.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use xenon_base::config::{SmcConfig, UartSystem};

/// Status register bit: a received byte is waiting.
pub const UART_STATUS_DATA_IN: u32 = 0x1;
/// Status register bit: the transmit FIFO is empty.
pub const UART_STATUS_EMPTY: u32 = 0x2;

/// Line configuration word for `115200,8,N,1`.
pub const UART_CONFIG_115200_8N1: u32 = 0x1E6;

pub trait UartBackend: Send {
    /// (Re)initializes the transport with the guest's line configuration.
    fn init(&mut self, config_word: u32);
    /// True until `init` has succeeded; also set again after a transport
    /// failure so the next status read re-initializes.
    fn setup_needed(&self) -> bool;
    fn read(&mut self) -> Option<u8>;
    fn write(&mut self, byte: u8);
    fn read_status(&mut self) -> u32;
    fn shutdown(&mut self);
}

pub fn create_backend(config: &SmcConfig) -> Box<dyn UartBackend> {
    match config.uart_system {
        UartSystem::Null => Box::new(NullUart::default()),
        UartSystem::Print => Box::new(SocketUart::new(
            config.socket_ip.clone(),
            config.socket_port,
            true,
        )),
        UartSystem::Socket => Box::new(SocketUart::new(
            config.socket_ip.clone(),
            config.socket_port,
            false,
        )),
        UartSystem::Vcom => vcom_backend(config),
    }
}

#[cfg(windows)]
fn vcom_backend(config: &SmcConfig) -> Box<dyn UartBackend> {
    Box::new(vcom::VcomUart::new(config.com_port.clone()))
}

#[cfg(not(windows))]
fn vcom_backend(_config: &SmcConfig) -> Box<dyn UartBackend> {
    tracing::warn!("vcom UART is only available on Windows; discarding serial traffic");
    Box::new(NullUart::default())
}

/// Discards transmitted bytes and never receives.
#[derive(Default)]
pub struct NullUart {
    initialized: bool,
}

impl UartBackend for NullUart {
    fn init(&mut self, _config_word: u32) {
        self.initialized = true;
    }

    fn setup_needed(&self) -> bool {
        !self.initialized
    }

    fn read(&mut self) -> Option<u8> {
        None
    }

    fn write(&mut self, _byte: u8) {}

    fn read_status(&mut self) -> u32 {
        UART_STATUS_EMPTY
    }

    fn shutdown(&mut self) {
        self.initialized = false;
    }
}

/// TCP server carrying the serial stream; a single client at a time.
pub struct SocketUart {
    ip: String,
    port: u16,
    echo_stdout: bool,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    rx: VecDeque<u8>,
}

impl SocketUart {
    pub fn new(ip: String, port: u16, echo_stdout: bool) -> Self {
        Self {
            ip,
            port,
            echo_stdout,
            listener: None,
            stream: None,
            rx: VecDeque::new(),
        }
    }

    /// Address the listener actually bound (the configured port may be 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn poll_connection(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        if self.stream.is_some() {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "serial client connected");
                if let Err(err) = stream.set_nonblocking(true) {
                    tracing::error!(%err, "failed to configure serial client socket");
                    return;
                }
                self.stream = Some(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => tracing::error!(%err, "serial accept failed"),
        }
    }

    fn pump_rx(&mut self) {
        let Some(stream) = &mut self.stream else {
            return;
        };
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    tracing::info!("serial client disconnected");
                    self.stream = None;
                    return;
                }
                Ok(n) => self.rx.extend(&buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::error!(%err, "serial read failed");
                    self.stream = None;
                    return;
                }
            }
        }
    }
}

impl UartBackend for SocketUart {
    fn init(&mut self, config_word: u32) {
        match TcpListener::bind((self.ip.as_str(), self.port)) {
            Ok(listener) => {
                if let Err(err) = listener.set_nonblocking(true) {
                    tracing::error!(%err, "failed to configure serial listener");
                    return;
                }
                tracing::info!(
                    addr = %format_args!("{}:{}", self.ip, self.port),
                    config = format_args!("{config_word:#x}"),
                    "serial socket listening"
                );
                self.listener = Some(listener);
            }
            Err(err) => {
                // Leave setup_needed set so the next status read retries.
                tracing::error!(%err, "failed to bind serial socket");
            }
        }
    }

    fn setup_needed(&self) -> bool {
        self.listener.is_none()
    }

    fn read(&mut self) -> Option<u8> {
        self.poll_connection();
        self.pump_rx();
        self.rx.pop_front()
    }

    fn write(&mut self, byte: u8) {
        if self.echo_stdout {
            print!("{}", byte as char);
            let _ = std::io::stdout().flush();
        }
        self.poll_connection();
        if let Some(stream) = &mut self.stream {
            if let Err(err) = stream.write_all(&[byte]) {
                tracing::error!(%err, "serial write failed");
                self.stream = None;
            }
        }
    }

    fn read_status(&mut self) -> u32 {
        self.poll_connection();
        self.pump_rx();
        let mut status = UART_STATUS_EMPTY;
        if !self.rx.is_empty() {
            status |= UART_STATUS_DATA_IN;
        }
        status
    }

    fn shutdown(&mut self) {
        self.stream = None;
        self.listener = None;
        self.rx.clear();
    }
}

#[cfg(windows)]
mod vcom {
    use super::{UartBackend, UART_STATUS_DATA_IN, UART_STATUS_EMPTY};
    use std::io::{Read, Write};
    use std::time::Duration;

    /// Host COM-port bridge.
    pub struct VcomUart {
        com_port: String,
        port: Option<Box<dyn serialport::SerialPort>>,
    }

    impl VcomUart {
        pub fn new(com_port: String) -> Self {
            Self {
                com_port,
                port: None,
            }
        }
    }

    impl UartBackend for VcomUart {
        fn init(&mut self, config_word: u32) {
            let baud = match config_word {
                super::UART_CONFIG_115200_8N1 => 115_200,
                other => {
                    tracing::warn!(
                        config = format_args!("{other:#x}"),
                        "unrecognized UART line configuration, assuming 115200"
                    );
                    115_200
                }
            };
            match serialport::new(&self.com_port, baud)
                .timeout(Duration::from_millis(1))
                .open()
            {
                Ok(port) => {
                    tracing::info!(port = %self.com_port, baud, "serial COM port opened");
                    self.port = Some(port);
                }
                Err(err) => tracing::error!(%err, port = %self.com_port, "failed to open COM port"),
            }
        }

        fn setup_needed(&self) -> bool {
            self.port.is_none()
        }

        fn read(&mut self) -> Option<u8> {
            let port = self.port.as_mut()?;
            if port.bytes_to_read().unwrap_or(0) == 0 {
                return None;
            }
            let mut byte = [0u8; 1];
            match port.read(&mut byte) {
                Ok(1) => Some(byte[0]),
                _ => None,
            }
        }

        fn write(&mut self, byte: u8) {
            if let Some(port) = &mut self.port {
                if let Err(err) = port.write_all(&[byte]) {
                    tracing::error!(%err, "COM port write failed");
                    self.port = None;
                }
            }
        }

        fn read_status(&mut self) -> u32 {
            let mut status = UART_STATUS_EMPTY;
            if let Some(port) = &mut self.port {
                if port.bytes_to_read().unwrap_or(0) > 0 {
                    status |= UART_STATUS_DATA_IN;
                }
            }
            status
        }

        fn shutdown(&mut self) {
            self.port = None;
        }
    }
}

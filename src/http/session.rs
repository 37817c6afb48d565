//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections. The agent
//! keeps connections as boxed `SessionOps` so a kept-alive plain or TLS
//! connection looks the same to the request code.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()>;

    /// Close the session
    fn close(&mut self) -> Result<()>;
}

impl<S: SessionOps + ?Sized> SessionOps for Box<S> {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        (**self).poll(events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Boxed session as stored by the agent
pub type BoxedSession = Box<dyn SessionOps + Send>;

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
}

/// Wait on a raw descriptor with `poll(2)`
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }

    Ok(result > 0)
}

/// HTTP session applying send and receive timeouts to a transport
pub struct HttpSession<S: SessionOps> {
    session: S,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Timeout waiting for response bytes
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Timeout waiting for the socket to accept request bytes
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Read data with timeout
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.read_timeout)? {
            return Err(Error::Timeout);
        }
        self.session.read(buf)
    }

    /// Write all of `buf` with timeout
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if !self.session.poll(PollEvents::Write, self.write_timeout)? {
                return Err(Error::Timeout);
            }
            let n = self.session.write(buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf = &buf[n..];
        }
        self.session.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn get_ref(&self) -> &S {
        &self.session
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_inner(self) -> S {
        self.session
    }
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Unwrap the TCP stream, e.g. to start TLS on a proxy tunnel
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        use std::net::Shutdown;
        match self.stream.shutdown(Shutdown::Both) {
            // Already gone is as closed as it gets
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Error::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_fd_session_ops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"Hello").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = FdSessionOps::new(stream);

        assert!(session.poll(PollEvents::Read, Some(Duration::from_secs(1))).unwrap());

        let mut buf = [0u8; 5];
        let n = session.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"Hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = HttpSession::new(FdSessionOps::new(stream));
        session.set_read_timeout(Some(Duration::from_millis(100)));

        let mut buf = [0u8; 10];
        assert!(matches!(session.read(&mut buf), Err(Error::Timeout)));
    }

    #[test]
    fn test_boxed_session_write_all() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let stream = TcpStream::connect(addr).unwrap();
        let boxed: BoxedSession = Box::new(FdSessionOps::new(stream));
        let mut session = HttpSession::new(boxed);
        session.set_write_timeout(Some(Duration::from_secs(1)));
        session.write_all(b"payload").unwrap();
        session.close().unwrap();

        assert_eq!(handle.join().unwrap(), b"payload");
    }
}

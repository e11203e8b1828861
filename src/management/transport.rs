//! Unix stream socket that carries file descriptors alongside the bytes
//!
//! The engine hands us sockets to protect and receives the tunnel
//! descriptor from us as `SCM_RIGHTS` ancillary data.

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Descriptors accepted per read
const MAX_FDS: usize = 8;

pub struct FdStream {
    stream: UnixStream,
}

impl FdStream {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Connected pair, used by tests and in-process engines
    pub fn pair() -> io::Result<(FdStream, FdStream)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Read bytes and any descriptors that arrived with them. Zero bytes
    /// means the peer closed the connection.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let fd = self.stream.as_raw_fd();
        loop {
            self.stream.readable().await?;
            match self
                .stream
                .try_io(Interest::READABLE, || recv_with_fds(fd, buf))
            {
                Ok(result) => return Ok(result),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write all of `data`, attaching `fds` to the first chunk
    pub async fn send(&self, data: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let fd = self.stream.as_raw_fd();
        let mut sent = 0;
        while sent < data.len() {
            self.stream.writable().await?;
            let attach: &[RawFd] = if sent == 0 { fds } else { &[] };
            match self
                .stream
                .try_io(Interest::WRITABLE, || send_with_fds(fd, &data[sent..], attach))
            {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty())?;

    let mut fds = Vec::new();
    for message in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = message {
            for raw_fd in raw {
                // SAFETY: the kernel just installed this descriptor for us and
                // nothing else owns it
                fds.push(unsafe { OwnedFd::from_raw_fd(raw_fd) });
            }
        }
    }
    Ok((msg.bytes, fds))
}

fn send_with_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let sent = if fds.is_empty() {
        sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None)?
    } else {
        sendmsg::<()>(fd, &iov, &[ControlMessage::ScmRights(fds)], MsgFlags::empty(), None)?
    };
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[tokio::test]
    async fn test_send_and_receive_bytes() {
        let (a, b) = FdStream::pair().unwrap();
        a.send(b"hold release\n", &[]).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, fds) = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hold release\n");
        assert!(fds.is_empty());
    }

    #[tokio::test]
    async fn test_descriptor_travels_with_message() {
        let (a, b) = FdStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"tunnel").unwrap();
        file.flush().unwrap();

        a.send(b"needok 'OPENTUN' ok\n", &[file.as_raw_fd()])
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, mut fds) = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"needok 'OPENTUN' ok\n");
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.remove(0));
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "tunnel");
    }

    #[tokio::test]
    async fn test_recv_reports_eof() {
        let (a, b) = FdStream::pair().unwrap();
        drop(a);
        let mut buf = [0u8; 16];
        let (n, _) = b.recv(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}

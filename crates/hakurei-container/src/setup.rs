//! Setup pipe transport.
//!
//! Records cross process boundaries as a 4-byte little-endian length followed
//! by a MessagePack body. The receiving side learns the descriptor number from
//! an environment variable and refuses oversized frames before allocating.

use std::env;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};

use rustix::pipe::{PipeFlags, pipe_with};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Largest frame a receiver accepts.
pub const MAX_SETUP_PAYLOAD: usize = 16 << 20;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{0} not set")]
    NotSet(&'static str),

    #[error("invalid setup descriptor")]
    InvalidDescriptor,

    #[error("setup payload of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("cannot encode setup payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("cannot decode setup payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("setup pipe: {0}")]
    Io(#[from] io::Error),
}

/// Write one framed record.
pub fn send<T: Serialize>(w: &mut impl Write, value: &T) -> Result<(), SetupError> {
    let body = rmp_serde::to_vec(value)?;
    if body.len() > MAX_SETUP_PAYLOAD {
        return Err(SetupError::TooLarge(body.len()));
    }
    let len = u32::try_from(body.len()).map_err(|_| SetupError::TooLarge(body.len()))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

/// Read one framed record.
pub fn receive<T: DeserializeOwned>(r: &mut impl Read) -> Result<T, SetupError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_SETUP_PAYLOAD {
        return Err(SetupError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(rmp_serde::from_slice(&body)?)
}

/// Create the setup pipe: the read end goes to the child, the write end stays.
pub fn pipe() -> io::Result<(OwnedFd, File)> {
    let (r, w) = pipe_with(PipeFlags::CLOEXEC)?;
    Ok((r, File::from(w)))
}

/// Take ownership of the descriptor named by `key` and remove `key` from the
/// environment.
///
/// Descriptors 0 to 2 are never accepted.
pub fn take_fd(key: &'static str) -> Result<File, SetupError> {
    let value = env::var(key).map_err(|_| SetupError::NotSet(key))?;
    // SAFETY: single-threaded at this point in every process that calls this.
    unsafe { env::remove_var(key) };
    let fd = parse_fd(&value).ok_or(SetupError::InvalidDescriptor)?;
    // reject descriptors that are not open
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(SetupError::InvalidDescriptor);
    }
    unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    // SAFETY: the descriptor is open and handed to us by the parent.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn parse_fd(s: &str) -> Option<i32> {
    let fd: i32 = s.parse().ok()?;
    (fd > 2).then_some(fd)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn framed_round_trip() {
        let mut buf = Vec::new();
        send(&mut buf, &("hello", 42u32)).unwrap();
        assert_eq!(&buf[..4], &(buf.len() as u32 - 4).to_le_bytes());
        let got: (String, u32) = receive(&mut Cursor::new(buf)).unwrap();
        assert_eq!(got, ("hello".to_string(), 42));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = ((MAX_SETUP_PAYLOAD + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 16]);
        let err = receive::<u32>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, SetupError::TooLarge(_)));
    }

    #[test]
    fn truncated_frame() {
        let buf = vec![8, 0, 0, 0, 1];
        let err = receive::<u64>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, SetupError::Io(_)));
    }

    #[test]
    fn parse_descriptor() {
        assert_eq!(parse_fd("3"), Some(3));
        assert_eq!(parse_fd("2"), None);
        assert_eq!(parse_fd("-1"), None);
        assert_eq!(parse_fd("x"), None);
    }

    #[test]
    fn over_pipe() {
        let (r, mut w) = pipe().unwrap();
        let writer = std::thread::spawn(move || send(&mut w, &vec![1u8, 2, 3]));
        let got: Vec<u8> = receive(&mut File::from(r)).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(got, [1, 2, 3]);
    }
}

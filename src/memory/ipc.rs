//! Handing an endpoint's memory to another process.
//!
//! One message per endpoint: the memfd travels as `SCM_RIGHTS` ancillary
//! data, the body carries the mapping size and the endpoint URI so the
//! receiver can register what it attached.
//!
//! ```text
//! body:  size: u64 LE | uri bytes (UTF-8, at most MAX_URI_LEN)
//! fds:   exactly one memfd
//! ```

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer, SendAncillaryMessage,
    SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Largest endpoint URI carried in one offer.
pub const MAX_URI_LEN: usize = 256;

const SIZE_LEN: usize = 8;

/// An endpoint mapping received from a peer, not yet mapped.
#[derive(Debug)]
pub struct SegmentOffer {
    /// The memfd.
    pub fd: OwnedFd,
    /// Mapping size in bytes.
    pub size: usize,
    /// Endpoint the memory belongs to.
    pub uri: String,
}

/// Send `fd` as the memory of endpoint `uri`.
pub fn offer_segment(socket: &UnixStream, fd: BorrowedFd<'_>, size: usize, uri: &str) -> Result<()> {
    if uri.is_empty() || uri.len() > MAX_URI_LEN {
        return Err(Error::InvalidEndpoint(uri.to_string()));
    }
    let mut body = Vec::with_capacity(SIZE_LEN + uri.len());
    body.extend_from_slice(&(size as u64).to_le_bytes());
    body.extend_from_slice(uri.as_bytes());

    let fds = [fd.as_fd()];
    let mut space = [MaybeUninit::<u8>::uninit(); 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(Error::InvalidSegment("fd does not fit the control buffer".into()));
    }
    sendmsg(socket, &[IoSlice::new(&body)], &mut ancillary, SendFlags::empty())?;
    Ok(())
}

/// Receive one [`offer_segment`] message.
///
/// # Errors
///
/// Fails on a short body, a URI that is not UTF-8, or a message that does
/// not carry exactly one fd. Extra fds are closed.
pub fn accept_segment(socket: &UnixStream) -> Result<SegmentOffer> {
    let mut body = [0u8; SIZE_LEN + MAX_URI_LEN];
    let mut space = [MaybeUninit::<u8>::uninit(); 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut space);
    let received = recvmsg(
        socket,
        &mut [IoSliceMut::new(&mut body)],
        &mut ancillary,
        RecvFlags::CMSG_CLOEXEC,
    )?;

    let mut fds: Vec<OwnedFd> = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }
    if fds.len() != 1 {
        return Err(Error::InvalidSegment(format!("expected one fd, got {}", fds.len())));
    }
    let n = received.bytes;
    if n <= SIZE_LEN {
        return Err(Error::InvalidSegment(format!("offer body is {n} bytes")));
    }

    let mut size = [0u8; SIZE_LEN];
    size.copy_from_slice(&body[..SIZE_LEN]);
    let size = usize::try_from(u64::from_le_bytes(size))
        .map_err(|_| Error::InvalidSegment("segment size does not fit in usize".into()))?;
    let uri = std::str::from_utf8(&body[SIZE_LEN..n])
        .map_err(|_| Error::InvalidSegment("endpoint URI is not UTF-8".into()))?
        .to_string();
    Ok(SegmentOffer {
        fd: fds.remove(0),
        size,
        uri,
    })
}

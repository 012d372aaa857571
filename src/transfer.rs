//! Hands a single-plane dmabuf to another process over a unix socket.
//!
//! One message per buffer: a fixed size [`FrameRecord`] as the payload and the
//! dmabuf file descriptor as `SCM_RIGHTS` ancillary data.

use crate::capture::CaptureError;
use crate::dmatex::{Dmatex, DmatexPlane, Resolution};
use crate::present::FrameSource;
use bytemuck::{Pod, Zeroable};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Payload of one transfer message, native endian.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameRecord {
    pub width: i32,
    pub height: i32,
    pub fourcc: u32,
    pub offset: i32,
    pub pitch: i32,
}

pub const RECORD_SIZE: usize = size_of::<FrameRecord>();

/// The kernel's `SCM_MAX_FD`. A receive buffer this large holds every
/// descriptor one message can carry, so a peer sending too many still has all
/// of them delivered and closed instead of truncated.
const MAX_RECEIVED_FDS: usize = 253;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Only single plane buffers can be transferred, this one has {0} planes")]
    UnsupportedPlaneCount(usize),
    #[error("Buffer geometry does not fit the wire record")]
    GeometryOutOfRange,
    #[error("Unable to send buffer: {0}")]
    Send(io::Error),
    #[error("Short send: {0} of {RECORD_SIZE} bytes")]
    ShortSend(usize),
    #[error("Unable to receive buffer: {0}")]
    Receive(io::Error),
    #[error("Peer does not speak the buffer protocol: {0}")]
    ProtocolMismatch(String),
    #[error("Unable to accept connection: {0}")]
    Accept(io::Error),
}

impl FrameRecord {
    pub fn for_dmatex(dma: &Dmatex) -> Result<Self, TransferError> {
        let [plane] = dma.planes.as_slice() else {
            return Err(TransferError::UnsupportedPlaneCount(dma.plane_count()));
        };
        let int = |value: u32| i32::try_from(value).map_err(|_| TransferError::GeometryOutOfRange);
        Ok(Self {
            width: int(dma.res.x)?,
            height: int(dma.res.y)?,
            fourcc: dma.format,
            offset: int(plane.offset)?,
            pitch: int(plane.stride)?,
        })
    }

    fn validate(&self) -> Result<(), TransferError> {
        if self.width <= 0 || self.height <= 0 || self.offset < 0 || self.pitch < 0 {
            return Err(TransferError::ProtocolMismatch(format!(
                "invalid geometry {self:?}"
            )));
        }
        Ok(())
    }
}

pub fn send_dmatex(stream: &UnixStream, dma: &Dmatex) -> Result<(), TransferError> {
    let record = FrameRecord::for_dmatex(dma)?;
    let fds = [dma.planes[0].raw_fd()];

    let sent = sendmsg::<()>(
        stream.as_raw_fd(),
        &[IoSlice::new(bytemuck::bytes_of(&record))],
        &[ControlMessage::ScmRights(&fds)],
        MsgFlags::empty(),
        None,
    )
    .map_err(|errno| TransferError::Send(errno.into()))?;

    if sent != RECORD_SIZE {
        return Err(TransferError::ShortSend(sent));
    }
    debug!("Sent {record:?}");
    Ok(())
}

/// Blocks until one buffer arrives.
///
/// Every descriptor that arrives is owned before validation starts, so a
/// rejected message closes what it carried.
pub fn recv_dmatex(stream: &UnixStream) -> Result<Dmatex, TransferError> {
    // one spare byte to notice oversized payloads
    let mut buf = [0u8; RECORD_SIZE + 1];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_RECEIVED_FDS]);

    let (bytes, truncated, mut fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(|errno| TransferError::Receive(errno.into()))?;

        let mut fds = Vec::<OwnedFd>::new();
        // cmsgs() refuses to parse once MSG_CTRUNC is set
        let cmsgs = msg.cmsgs();
        let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC) || cmsgs.is_err();
        for cmsg in cmsgs.into_iter().flatten() {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                // SAFETY: SCM_RIGHTS hands us fresh descriptors nobody else owns.
                fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        (msg.bytes, truncated, fds)
    };

    if bytes != RECORD_SIZE {
        return Err(TransferError::ProtocolMismatch(format!(
            "expected a {RECORD_SIZE} byte record, got {bytes}{}",
            if bytes > RECORD_SIZE { " or more" } else { "" }
        )));
    }
    if truncated {
        return Err(TransferError::ProtocolMismatch(
            "control data was truncated".to_string(),
        ));
    }
    if fds.len() != 1 {
        return Err(TransferError::ProtocolMismatch(format!(
            "expected exactly one file descriptor, got {}",
            fds.len()
        )));
    }

    let record: FrameRecord = bytemuck::pod_read_unaligned(&buf[..RECORD_SIZE]);
    record.validate()?;
    debug!("Received {record:?}");

    Ok(Dmatex {
        planes: vec![DmatexPlane {
            dmabuf_fd: fds.remove(0),
            offset: record.offset as u32,
            stride: record.pitch as u32,
        }],
        res: Resolution {
            x: record.width as u32,
            y: record.height as u32,
        },
        format: record.fourcc,
        modifier: None,
    })
}

/// Sends the current frame of `source` to every client that connects.
///
/// Stops after `limit` connections when given, otherwise runs until accepting
/// fails. Capture and send failures only drop the affected client.
pub fn serve<S: FrameSource>(
    listener: &UnixListener,
    source: &mut S,
    limit: Option<usize>,
) -> Result<(), TransferError> {
    let mut served = 0;
    while limit.is_none_or(|limit| served < limit) {
        let (stream, _) = listener.accept().map_err(TransferError::Accept)?;
        served += 1;

        let dma = match capture_frame(source) {
            Ok(dma) => dma,
            Err(err) => {
                warn!("Dropping client, capture failed during {}: {err}", err.stage());
                continue;
            }
        };
        match send_dmatex(&stream, &dma) {
            Ok(()) => info!(
                "Sent {}x{} {} to client {served}",
                dma.res.x,
                dma.res.y,
                dma.format_name()
            ),
            Err(err) => warn!("Unable to send to client {served}: {err}"),
        }
    }
    Ok(())
}

fn capture_frame<S: FrameSource>(source: &mut S) -> Result<Dmatex, CaptureError> {
    let key = source.locate()?;
    source.export(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm_fourcc::{DrmFourcc, DrmModifier};
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    use std::io::{PipeReader, Read, Write};

    fn piped(res: (u32, u32), planes: usize) -> (Dmatex, Vec<PipeReader>) {
        let mut readers = Vec::new();
        let planes = (0..planes)
            .map(|i| {
                let (reader, writer) = io::pipe().unwrap();
                readers.push(reader);
                DmatexPlane {
                    dmabuf_fd: writer.into(),
                    offset: i as u32 * 0x1000,
                    stride: res.0 * 4,
                }
            })
            .collect();
        let dma = Dmatex {
            planes,
            res: Resolution { x: res.0, y: res.1 },
            format: DrmFourcc::Xrgb8888 as u32,
            modifier: Some(DrmModifier::Linear),
        };
        (dma, readers)
    }

    fn raw_send(stream: &UnixStream, payload: &[u8], fds: &[RawFd]) {
        let cmsgs = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &cmsgs };
        sendmsg::<()>(
            stream.as_raw_fd(),
            &[IoSlice::new(payload)],
            cmsgs,
            MsgFlags::empty(),
            None,
        )
        .unwrap();
    }

    /// EOF means every write end is closed. A leaked one reports
    /// `WouldBlock` instead of hanging the test.
    fn assert_closed(reader: &mut PipeReader) {
        fcntl(reader.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn record_is_twenty_bytes() {
        assert_eq!(RECORD_SIZE, 20);
    }

    #[test]
    fn buffer_crosses_the_socket() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (dma, mut readers) = piped((1920, 1080), 1);

        send_dmatex(&tx, &dma).unwrap();
        drop(dma);
        let mut received = recv_dmatex(&rx).unwrap();

        assert_eq!(received.res, Resolution { x: 1920, y: 1080 });
        assert_eq!(received.format, DrmFourcc::Xrgb8888 as u32);
        assert_eq!(received.planes[0].stride, 1920 * 4);
        assert_eq!(received.modifier, None);

        let mut writer = std::fs::File::from(received.planes.remove(0).dmabuf_fd);
        writer.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        readers[0].read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn multi_plane_buffers_are_refused() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        let (dma, _readers) = piped((64, 64), 2);
        assert!(matches!(
            send_dmatex(&tx, &dma),
            Err(TransferError::UnsupportedPlaneCount(2))
        ));
    }

    #[test]
    fn short_payload_is_rejected_and_its_fd_closed() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (dma, mut readers) = piped((64, 64), 1);

        raw_send(&tx, &[0u8; RECORD_SIZE - 1], &[dma.planes[0].raw_fd()]);
        drop(dma);

        assert!(matches!(recv_dmatex(&rx), Err(TransferError::ProtocolMismatch(_))));
        assert_closed(&mut readers[0]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (dma, _readers) = piped((64, 64), 1);
        raw_send(&tx, &[0u8; RECORD_SIZE + 4], &[dma.planes[0].raw_fd()]);
        assert!(matches!(recv_dmatex(&rx), Err(TransferError::ProtocolMismatch(_))));
    }

    #[test]
    fn missing_fd_is_rejected() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let record = FrameRecord {
            width: 64,
            height: 64,
            fourcc: DrmFourcc::Xrgb8888 as u32,
            offset: 0,
            pitch: 256,
        };
        raw_send(&tx, bytemuck::bytes_of(&record), &[]);
        assert!(matches!(recv_dmatex(&rx), Err(TransferError::ProtocolMismatch(_))));
    }

    #[test]
    fn extra_fds_are_rejected_and_closed() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (dma, mut readers) = piped((64, 64), 2);
        let record = FrameRecord {
            width: 64,
            height: 64,
            fourcc: dma.format,
            offset: 0,
            pitch: 256,
        };
        let fds: Vec<RawFd> = dma.planes.iter().map(DmatexPlane::raw_fd).collect();

        raw_send(&tx, bytemuck::bytes_of(&record), &fds);
        drop(dma);

        assert!(matches!(recv_dmatex(&rx), Err(TransferError::ProtocolMismatch(_))));
        for reader in &mut readers {
            assert_closed(reader);
        }
    }

    #[test]
    fn a_dozen_fds_are_all_delivered_and_closed() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (dma, mut readers) = piped((64, 64), 12);
        let record = FrameRecord {
            width: 64,
            height: 64,
            fourcc: dma.format,
            offset: 0,
            pitch: 256,
        };
        let fds: Vec<RawFd> = dma.planes.iter().map(DmatexPlane::raw_fd).collect();

        raw_send(&tx, bytemuck::bytes_of(&record), &fds);
        drop(dma);

        let err = recv_dmatex(&rx).unwrap_err();
        assert!(
            matches!(&err, TransferError::ProtocolMismatch(reason) if reason.contains("got 12")),
            "{err}"
        );
        for reader in &mut readers {
            assert_closed(reader);
        }
    }

    #[test]
    fn negative_geometry_is_rejected() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (dma, _readers) = piped((64, 64), 1);
        let record = FrameRecord {
            width: -64,
            height: 64,
            fourcc: dma.format,
            offset: 0,
            pitch: 256,
        };
        raw_send(&tx, bytemuck::bytes_of(&record), &[dma.planes[0].raw_fd()]);
        assert!(matches!(recv_dmatex(&rx), Err(TransferError::ProtocolMismatch(_))));
    }
}

//! Exchange of the session preface that asserts complementary roles.
//!
//! Both sides write their four byte preface and then read the preface of the
//! peer. Writing first on both ends cannot deadlock because the preface is
//! far smaller than any socket buffer.
use futures::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SessionError;
use crate::role::Role;

const MAGIC: [u8; 2] = *b"TM";
const VERSION: u8 = 1;
const ACCEPTOR_MASK: u8 = 0b01;
const BIDIRECTIONAL_MASK: u8 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Preface {
    pub role: Role,
    pub bidirectional: bool,
}

impl Preface {
    pub const SIZE: usize = 4;

    pub fn build(&self) -> [u8; Self::SIZE] {
        let mut flags = 0;
        if self.role == Role::Acceptor {
            flags |= ACCEPTOR_MASK;
        }
        if self.bidirectional {
            flags |= BIDIRECTIONAL_MASK;
        }
        [MAGIC[0], MAGIC[1], VERSION, flags]
    }

    pub fn parse(data: [u8; Self::SIZE]) -> Result<Self, SessionError> {
        let flags = data[3];
        if data[..2] != MAGIC || data[2] != VERSION || flags & !(ACCEPTOR_MASK | BIDIRECTIONAL_MASK) != 0
        {
            return Err(SessionError::InvalidPreface { preface: data });
        }
        let role = if flags & ACCEPTOR_MASK != 0 {
            Role::Acceptor
        } else {
            Role::Opener
        };
        Ok(Self {
            role,
            bidirectional: flags & BIDIRECTIONAL_MASK != 0,
        })
    }
}

/// Send the local preface, read the remote one and check that both agree.
pub(crate) async fn exchange(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    local: Preface,
    timeout: Duration,
) -> Result<(), SessionError> {
    let exchange = async {
        stream
            .write_all(&local.build())
            .await
            .map_err(|error| SessionError::PrefaceWrite(Arc::new(error)))?;
        stream
            .flush()
            .await
            .map_err(|error| SessionError::PrefaceWrite(Arc::new(error)))?;
        let mut reply = [0u8; Preface::SIZE];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|error| SessionError::PrefaceRead(Arc::new(error)))?;
        Preface::parse(reply)
    };
    let remote = async_std::future::timeout(timeout, exchange)
        .await
        .map_err(|_| SessionError::PrefaceTimeout)??;
    tracing::trace!(?local, ?remote, "exchanged session preface");

    if remote.role == local.role {
        return Err(SessionError::RoleConflict { role: local.role });
    }
    if remote.bidirectional != local.bidirectional {
        return Err(SessionError::ConfigMismatch {
            local: local.bidirectional,
            remote: remote.bidirectional,
        });
    }
    Ok(())
}

/// Which side of a session may request new streams.
///
/// The role is chosen when the session is constructed and is independent of
/// which side dialed the underlying connection. The two ends of a connection
/// must use complementary roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opens streams. Streams opened by the opener have odd ids.
    Opener,
    /// Accepts streams opened by the remote opener. In bidirectional
    /// sessions the acceptor opens streams with even ids.
    Acceptor,
}

impl Role {
    pub fn complement(self) -> Self {
        match self {
            Role::Opener => Role::Acceptor,
            Role::Acceptor => Role::Opener,
        }
    }

    /// Id of the first stream opened by this side.
    pub(crate) fn first_stream_id(self) -> u32 {
        match self {
            Role::Opener => 1,
            Role::Acceptor => 2,
        }
    }

    /// Returns true if `stream_id` belongs to streams opened by this side.
    pub(crate) fn owns_stream_id(self, stream_id: u32) -> bool {
        match self {
            Role::Opener => stream_id % 2 == 1,
            Role::Acceptor => stream_id != 0 && stream_id % 2 == 0,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Opener => f.write_str("opener"),
            Role::Acceptor => f.write_str("acceptor"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "opener" => Ok(Role::Opener),
            "acceptor" => Ok(Role::Acceptor),
            value => Err(ParseRoleError {
                value: value.to_string(),
            }),
        }
    }
}

/// Error returned when parsing a [Role] from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid role \"{value}\". Expected \"opener\" or \"acceptor\"")]
pub struct ParseRoleError {
    value: String,
}

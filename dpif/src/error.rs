use thiserror::Error;

use dpif_socket::{ResolveError, SessionError};
use dpif_wire::{CodecError, KeyError};

/// The family a request was addressed to. Decides what a kernel "not found"
/// means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyKind {
    Datapath,
    Vport,
    Flow,
}

/// A kernel refusal, classified by the family that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    #[error("No such datapath")]
    NoSuchDatapath,
    #[error("No such vport")]
    NoSuchVport,
    #[error("No such flow")]
    NoSuchFlow,
    #[error("Already exists")]
    AlreadyExists,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Resource busy")]
    Busy,
    #[error("Operation not supported")]
    Unsupported,
    #[error("Kernel error: errno {0}")]
    Other(i32),
}

impl KernelError {
    pub fn from_errno(family: FamilyKind, errno: i32) -> Self {
        match errno {
            // A flow request naming a missing datapath
            libc::ENODEV if family == FamilyKind::Flow => Self::NoSuchDatapath,
            libc::ENOENT | libc::ENODEV => match family {
                FamilyKind::Datapath => Self::NoSuchDatapath,
                FamilyKind::Vport => Self::NoSuchVport,
                FamilyKind::Flow => Self::NoSuchFlow,
            },
            libc::EEXIST => Self::AlreadyExists,
            libc::EINVAL => Self::InvalidArgument,
            libc::EBUSY => Self::Busy,
            libc::EOPNOTSUPP | libc::EAFNOSUPPORT => Self::Unsupported,
            errno => Self::Other(errno),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoSuchDatapath | Self::NoSuchVport | Self::NoSuchFlow)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("Session error: {0}")]
    Session(SessionError),
    #[error("Family resolution error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("Attribute codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Flow key error: {0}")]
    Key(#[from] KeyError),
    #[error("Malformed reply: {0}")]
    Malformed(&'static str),
}

impl Error {
    /// Classifies a session failure for a request sent to `family`.
    pub(crate) fn from_session(family: FamilyKind, err: SessionError) -> Self {
        match err {
            SessionError::Kernel(errno) => Self::Kernel(KernelError::from_errno(family, errno)),
            err => Self::Session(err),
        }
    }

    /// Returns the kernel's refusal, if this is one.
    pub fn kernel(&self) -> Option<KernelError> {
        match self {
            Self::Kernel(err) => Some(*err),
            _ => None,
        }
    }
}

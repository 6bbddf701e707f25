use core::fmt;

use thiserror::Error;

use crate::{
    Handle,
    system::{
        ArgumentException, Exception, InvalidCastException,
        InvalidOperationException, NullReferenceException,
    },
};

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Managed(ManagedException),
    #[error("{0}")]
    Native(String),
    #[error(
        "plugin memory size is too low: required {required} bytes, provided {provided}"
    )]
    MemoryTooLow { required: usize, provided: usize },
    #[error("managed function `{0}` is null")]
    MissingFunction(&'static str),
    #[error("no bridge context is installed on this thread")]
    NoContext,
    #[error("managed side returned a null handle from `{0}`")]
    NullHandle(&'static str),
    #[error("unknown init mode {0}")]
    InvalidInitMode(u8),
}

impl BridgeError {
    pub fn native(message: impl Into<String>) -> Self {
        Self::Native(message.into())
    }

    /// The typed managed exception, if this error came from the managed side.
    pub fn managed(&self) -> Option<&ManagedException> {
        match self {
            Self::Managed(exception) => Some(exception),
            _ => None,
        }
    }
}

impl From<ManagedException> for BridgeError {
    fn from(exception: ManagedException) -> Self {
        Self::Managed(exception)
    }
}

/// Managed exception classes native code can catch by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionClass {
    Exception,
    NullReference,
    Argument,
    InvalidOperation,
    InvalidCast,
}

impl ExceptionClass {
    pub const ALL: [ExceptionClass; 5] = [
        ExceptionClass::Exception,
        ExceptionClass::NullReference,
        ExceptionClass::Argument,
        ExceptionClass::InvalidOperation,
        ExceptionClass::InvalidCast,
    ];

    pub fn managed_name(self) -> &'static str {
        match self {
            Self::Exception => "System.Exception",
            Self::NullReference => "System.NullReferenceException",
            Self::Argument => "System.ArgumentException",
            Self::InvalidOperation => "System.InvalidOperationException",
            Self::InvalidCast => "System.InvalidCastException",
        }
    }
}

/// A managed exception received through a trampoline.
///
/// Each variant is the thrower for one recognized class: matching on the
/// variant is the native equivalent of a typed `catch`. The mirror inside
/// keeps the managed object alive and preserves its identity, so handing
/// it back to the managed side rethrows the very same object.
#[derive(Debug, Clone)]
pub enum ManagedException {
    Exception(Exception),
    NullReference(NullReferenceException),
    Argument(ArgumentException),
    InvalidOperation(InvalidOperationException),
    InvalidCast(InvalidCastException),
}

impl ManagedException {
    /// Adopts `handle` as an exception of `class`, taking one reference.
    pub fn acquire(class: ExceptionClass, handle: Handle) -> Self {
        match class {
            ExceptionClass::Exception => {
                Self::Exception(Exception::acquire(handle))
            }
            ExceptionClass::NullReference => {
                Self::NullReference(NullReferenceException::acquire(handle))
            }
            ExceptionClass::Argument => {
                Self::Argument(ArgumentException::acquire(handle))
            }
            ExceptionClass::InvalidOperation => Self::InvalidOperation(
                InvalidOperationException::acquire(handle),
            ),
            ExceptionClass::InvalidCast => {
                Self::InvalidCast(InvalidCastException::acquire(handle))
            }
        }
    }

    pub fn class(&self) -> ExceptionClass {
        match self {
            Self::Exception(_) => ExceptionClass::Exception,
            Self::NullReference(_) => ExceptionClass::NullReference,
            Self::Argument(_) => ExceptionClass::Argument,
            Self::InvalidOperation(_) => ExceptionClass::InvalidOperation,
            Self::InvalidCast(_) => ExceptionClass::InvalidCast,
        }
    }

    /// Every recognized class derives from `System.Exception`.
    pub fn as_exception(&self) -> &Exception {
        match self {
            Self::Exception(e) => e,
            Self::NullReference(e) => &**e,
            Self::Argument(e) => &**e,
            Self::InvalidOperation(e) => &**e,
            Self::InvalidCast(e) => &**e,
        }
    }

    pub fn handle(&self) -> Handle {
        self.as_exception().handle()
    }

    pub fn message(&self) -> Result<String> {
        self.as_exception().message()?.to_rust_string()
    }
}

impl fmt::Display for ManagedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (handle {})",
            self.class().managed_name(),
            self.handle()
        )
    }
}

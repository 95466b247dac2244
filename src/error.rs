use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorType {
    A3UnknownProperty,
    A3ReadOnlyProperty,
    A3InvalidValue,
    A3StreamConflict,
    QueueOverflow,
    StorageError,
    ConfigError,
    RuntimeError,
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub error_type: ErrorType,
    pub message: String,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}; {}", self.error_type, self.message)
    }
}

impl std::error::Error for AppError {}

impl AppError {
    pub fn new(error_type: ErrorType, message: String) -> Self {
        Self {
            error_type,
            message,
        }
    }

    pub fn overflow(what: &str) -> Self {
        Self {
            error_type: ErrorType::QueueOverflow,
            message: format!("{} is full", what),
        }
    }

    pub fn unknown_property(id: u8) -> Self {
        Self {
            error_type: ErrorType::A3UnknownProperty,
            message: format!("No such property: {}", id),
        }
    }

    pub fn storage(message: String) -> Self {
        Self {
            error_type: ErrorType::StorageError,
            message,
        }
    }

    pub fn config(message: String) -> Self {
        Self {
            error_type: ErrorType::ConfigError,
            message,
        }
    }

    pub fn runtime(message: &str) -> Self {
        Self {
            error_type: ErrorType::RuntimeError,
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

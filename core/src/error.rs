//! Error types for the bot framework

use thiserror::Error;

/// Main error type for the bot framework
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message parsing error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Temporary connection failure: {0}")]
    ConnectTemporary(String),

    #[error("Permanent connection failure: {0}")]
    ConnectPermanent(String),

    #[error("Client is closed")]
    ClientClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Killed while connecting")]
    KilledDuringConnect,

    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Too many arguments for command: {0}")]
    ExcessArguments(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Command already registered: {0}")]
    DuplicateCommand(String),

    #[error("Invalid argument specification: {0}")]
    ArgSpecInvalid(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User is not registered: {0}")]
    UserNotRegistered(String),

    #[error("User is not authenticated: {0}")]
    UserNotAuthed(String),

    #[error("Host does not match any stored hosts")]
    UserBadHost,

    #[error("Password does not match")]
    UserBadPassword,

    #[error("Missing required flags: {0}")]
    Flags(String),

    #[error("Access denied, required level: {0}")]
    Access(u8),

    #[error("State tracking is disabled")]
    StateDisabled,

    #[error("User store is disabled")]
    StoreDisabled,

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error("Network capabilities are missing CHANTYPES or PREFIX")]
    ProtoCapsMissing,

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Password hashing error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),

    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    #[error("Database open error: {0}")]
    DatabaseOpen(#[from] redb::DatabaseError),

    #[error("Database table error: {0}")]
    DatabaseTable(#[from] redb::TableError),

    #[error("Database storage error: {0}")]
    DatabaseStorage(#[from] redb::StorageError),

    #[error("Database transaction error: {0}")]
    DatabaseTransaction(#[from] redb::TransactionError),

    #[error("Database commit error: {0}")]
    DatabaseCommit(#[from] redb::CommitError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a failed connection attempt is worth retrying on another
    /// server in the rotation.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::ConnectTemporary(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

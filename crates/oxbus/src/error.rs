use thiserror::Error;

/// Stack-level error kinds.
///
/// Surfaced both as Rust errors from the synchronous entry points and as
/// the `exception_code` byte of a completion record whose status is
/// [`ExceptionStatus::StackError`]. Discriminants are stable: they are the
/// wire-visible codes handed to the application.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    #[error("transaction or unit id in response mismatches the request")]
    CorrelationMismatch = 1,
    #[error("socket setup failed")]
    SocketFailed = 2,
    #[error("connection to the device failed")]
    ConnectFailed = 3,
    #[error("failed to send request")]
    SendFailed = 4,
    #[error("failed to receive response")]
    RecvFailed = 5,
    #[error("no response within the configured timeout")]
    RecvTimeout = 6,
    #[error("allocation failed")]
    AllocFailed = 7,
    #[error("failed to enqueue onto the carrier work queue")]
    QueueSend = 8,
    #[error("all request slots are in flight")]
    MaxRequestsInFlight = 9,
    #[error("invalid input parameter")]
    InvalidInput = 10,
    #[error("packet length exceeds the protocol limit")]
    PacketLengthExceeded = 11,
    #[error("thread creation failed")]
    ThreadCreate = 12,
    #[error("serial port could not be initialised")]
    SerialPortError = 13,
    #[error("unsupported baud rate")]
    InvalidBaudRate = 14,
    #[error("unknown context")]
    UnknownContext = 15,
    #[error("invalid stack configuration")]
    InvalidConfig = 16,
}

impl ErrorKind {
    /// The code byte carried in a completion record.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// First of the two orthogonal status bytes on a completion.
///
/// Distinguishes a clean decode, a protocol exception frame answered by
/// the device, and a failure inside the stack before any protocol-level
/// answer was obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionStatus {
    #[default]
    None = 0,
    /// The device replied with an exception frame; the code byte carries
    /// the protocol exception value (0x01..=0x0B).
    Exception = 1,
    /// The stack failed; the code byte carries an [`ErrorKind`] code.
    StackError = 2,
}

/// Error code registry for brokermr
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Decode errors
/// - 3000-3999: Compute errors
/// - 4000-4999: Broker errors
/// - 5000-5999: Coordination errors
/// - 9000-9999: Other errors
#[allow(dead_code)]
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_INVALID_TOML: u16 = 1002;
    pub const CONFIG_INVALID_VALUE: u16 = 1003;
    pub const CONFIG_LENGTH_UNDETERMINED: u16 = 1004;
    pub const CONFIG_EMPTY_DATASET: u16 = 1005;
    pub const CONFIG_MALFORMED_SOURCE: u16 = 1006;
    pub const CONFIG_PARTITION_OUT_OF_RANGE: u16 = 1007;
    pub const CONFIG_UNKNOWN_COMPUTATION: u16 = 1008;
    pub const CONFIG_FEATURE_DISABLED: u16 = 1009;

    // Decode errors (2000-2999)
    pub const DECODE_GENERIC: u16 = 2000;
    pub const DECODE_MALFORMED: u16 = 2001;
    pub const DECODE_UNSUPPORTED_VERSION: u16 = 2002;
    pub const DECODE_UNEXPECTED_KIND: u16 = 2003;
    pub const DECODE_MISROUTED: u16 = 2004;
    pub const ENCODE_FAILED: u16 = 2100;

    // Compute errors (3000-3999)
    pub const COMPUTE_GENERIC: u16 = 3000;
    pub const COMPUTE_PANICKED: u16 = 3001;
    pub const COMPUTE_SOURCE_FAILED: u16 = 3002;

    // Broker errors (4000-4999)
    pub const BROKER_GENERIC: u16 = 4000;
    pub const BROKER_CONNECTION: u16 = 4001;
    pub const BROKER_DISCONNECTED: u16 = 4002;
    pub const BROKER_QUEUE_NOT_FOUND: u16 = 4003;
    pub const BROKER_UNKNOWN_DELIVERY: u16 = 4004;

    // Coordination errors (5000-5999)
    pub const COORD_GENERIC: u16 = 5000;
    pub const COORD_PARTITION_EXHAUSTED: u16 = 5001;
    pub const COORD_INCOMPLETE_RUN: u16 = 5002;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_INTERNAL_ERROR: u16 = 9001;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        // Configuration errors
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1002 => "Invalid TOML syntax in configuration",
        1003 => "Invalid value in configuration",
        1004 => "Dataset length cannot be determined",
        1005 => "Inline dataset is empty",
        1006 => "Malformed data source parameters",
        1007 => "Partition lies outside the dataset",
        1008 => "Computation is not registered",
        1009 => "Required cargo feature is not enabled",

        // Decode errors
        2000 => "Generic decode error",
        2001 => "Message payload is malformed",
        2002 => "Message uses an unsupported wire version",
        2003 => "Message kind does not match the expected kind",
        2004 => "Message was routed to the wrong computation",
        2100 => "Failed to encode message payload",

        // Compute errors
        3000 => "Generic compute error",
        3001 => "Map or reduce panicked",
        3002 => "Data source failed while iterating",

        // Broker errors
        4000 => "Generic broker error",
        4001 => "Failed to connect to broker",
        4002 => "Broker closed the connection",
        4003 => "Queue does not exist",
        4004 => "Delivery tag is unknown to the broker",

        // Coordination errors
        5000 => "Generic coordination error",
        5001 => "Partition exhausted its dispatch attempts",
        5002 => "Run finished with unfilled result slots",

        // Other errors
        9000 => "Generic error",
        9001 => "Internal error",

        _ => "Unknown error code",
    }
}

//! Result codes returned by call-stack operations
//!
//! Negative codes are routine failures handed back to the immediate
//! caller. Positive codes describe what a successful call did.

/// Outcome of a call-stack operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SpiResultCode {
    ErrorConnect = -1,
    ErrorCopy = -2,
    ErrorOpUnknown = -3,
    ErrorUnconnected = -4,
    ErrorCursor = -5,
    ErrorArgument = -6,
    ErrorParam = -7,
    ErrorTransaction = -8,
    ErrorNoAttribute = -9,
    ErrorNoOutFunc = -10,
    ErrorTypUnknown = -11,

    OkConnect = 1,
    OkFinish = 2,
    OkFetch = 3,
    OkUtility = 4,
    OkSelect = 5,
    OkSelInto = 6,
    OkInsert = 7,
    OkDelete = 8,
    OkUpdate = 9,
    OkCursor = 10,
    OkInsertReturning = 11,
    OkDeleteReturning = 12,
    OkUpdateReturning = 13,
    OkRewritten = 14,
    OkMerge = 15,
}

impl SpiResultCode {
    const ALL: [SpiResultCode; 26] = [
        SpiResultCode::ErrorConnect,
        SpiResultCode::ErrorCopy,
        SpiResultCode::ErrorOpUnknown,
        SpiResultCode::ErrorUnconnected,
        SpiResultCode::ErrorCursor,
        SpiResultCode::ErrorArgument,
        SpiResultCode::ErrorParam,
        SpiResultCode::ErrorTransaction,
        SpiResultCode::ErrorNoAttribute,
        SpiResultCode::ErrorNoOutFunc,
        SpiResultCode::ErrorTypUnknown,
        SpiResultCode::OkConnect,
        SpiResultCode::OkFinish,
        SpiResultCode::OkFetch,
        SpiResultCode::OkUtility,
        SpiResultCode::OkSelect,
        SpiResultCode::OkSelInto,
        SpiResultCode::OkInsert,
        SpiResultCode::OkDelete,
        SpiResultCode::OkUpdate,
        SpiResultCode::OkCursor,
        SpiResultCode::OkInsertReturning,
        SpiResultCode::OkDeleteReturning,
        SpiResultCode::OkUpdateReturning,
        SpiResultCode::OkRewritten,
        SpiResultCode::OkMerge,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    pub fn is_error(self) -> bool {
        self.code() < 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpiResultCode::ErrorConnect => "SPI_ERROR_CONNECT",
            SpiResultCode::ErrorCopy => "SPI_ERROR_COPY",
            SpiResultCode::ErrorOpUnknown => "SPI_ERROR_OPUNKNOWN",
            SpiResultCode::ErrorUnconnected => "SPI_ERROR_UNCONNECTED",
            SpiResultCode::ErrorCursor => "SPI_ERROR_CURSOR",
            SpiResultCode::ErrorArgument => "SPI_ERROR_ARGUMENT",
            SpiResultCode::ErrorParam => "SPI_ERROR_PARAM",
            SpiResultCode::ErrorTransaction => "SPI_ERROR_TRANSACTION",
            SpiResultCode::ErrorNoAttribute => "SPI_ERROR_NOATTRIBUTE",
            SpiResultCode::ErrorNoOutFunc => "SPI_ERROR_NOOUTFUNC",
            SpiResultCode::ErrorTypUnknown => "SPI_ERROR_TYPUNKNOWN",
            SpiResultCode::OkConnect => "SPI_OK_CONNECT",
            SpiResultCode::OkFinish => "SPI_OK_FINISH",
            SpiResultCode::OkFetch => "SPI_OK_FETCH",
            SpiResultCode::OkUtility => "SPI_OK_UTILITY",
            SpiResultCode::OkSelect => "SPI_OK_SELECT",
            SpiResultCode::OkSelInto => "SPI_OK_SELINTO",
            SpiResultCode::OkInsert => "SPI_OK_INSERT",
            SpiResultCode::OkDelete => "SPI_OK_DELETE",
            SpiResultCode::OkUpdate => "SPI_OK_UPDATE",
            SpiResultCode::OkCursor => "SPI_OK_CURSOR",
            SpiResultCode::OkInsertReturning => "SPI_OK_INSERT_RETURNING",
            SpiResultCode::OkDeleteReturning => "SPI_OK_DELETE_RETURNING",
            SpiResultCode::OkUpdateReturning => "SPI_OK_UPDATE_RETURNING",
            SpiResultCode::OkRewritten => "SPI_OK_REWRITTEN",
            SpiResultCode::OkMerge => "SPI_OK_MERGE",
        }
    }
}

impl std::fmt::Display for SpiResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of a raw result code, for messages built from integer codes.
pub fn result_code_string(code: i32) -> String {
    match SpiResultCode::from_code(code) {
        Some(c) => c.as_str().to_string(),
        None => format!("Unrecognized SPI code {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_wire_values() {
        assert_eq!(SpiResultCode::ErrorConnect.code(), -1);
        assert_eq!(SpiResultCode::ErrorTypUnknown.code(), -11);
        assert_eq!(SpiResultCode::OkRewritten.code(), 14);
        assert_eq!(SpiResultCode::OkMerge.code(), 15);
    }

    #[test]
    fn test_result_code_string() {
        assert_eq!(result_code_string(-6), "SPI_ERROR_ARGUMENT");
        assert_eq!(result_code_string(11), "SPI_OK_INSERT_RETURNING");
        assert_eq!(result_code_string(0), "Unrecognized SPI code 0");
        assert_eq!(result_code_string(99), "Unrecognized SPI code 99");
    }

    #[test]
    fn test_error_codes_are_negative() {
        for code in SpiResultCode::ALL {
            assert_eq!(code.is_error(), code.code() < 0);
            assert_eq!(SpiResultCode::from_code(code.code()), Some(code));
        }
    }
}

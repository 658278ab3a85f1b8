//! Wire command and sub-command codes
//!
//! The numeric values are the on-the-wire representation and are frozen for
//! compatibility with deployed peers. Nothing outside this crate should see
//! the raw integers.

use stagehand_types::{Error, Result};

/// Top-level commands sent from the upload side to the download side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferCommand {
    /// End of stream
    Finished,
    /// Next item is a file using the channel-default encryption
    File,
    /// Next item is a file with encryption forced on
    EnableEncryption,
    /// Next item is a file with encryption forced off
    DisableEncryption,
    /// Next item is a delegated credential
    DelegateCredential,
    /// A URL follows; the receiver fetches it via a plugin
    DownloadUrl,
    /// Make a directory; a mode record follows
    Mkdir,
    /// A structured sub-command record follows
    Other,
}

impl TransferCommand {
    /// Numeric wire code of this command
    pub fn code(&self) -> i64 {
        match self {
            Self::Finished => 0,
            Self::File => 1,
            Self::EnableEncryption => 2,
            Self::DisableEncryption => 3,
            Self::DelegateCredential => 4,
            Self::DownloadUrl => 5,
            Self::Mkdir => 6,
            Self::Other => 999,
        }
    }

    /// Decode a wire code, failing on anything unrecognised
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Finished),
            1 => Ok(Self::File),
            2 => Ok(Self::EnableEncryption),
            3 => Ok(Self::DisableEncryption),
            4 => Ok(Self::DelegateCredential),
            5 => Ok(Self::DownloadUrl),
            6 => Ok(Self::Mkdir),
            999 => Ok(Self::Other),
            other => Err(Error::protocol(format!(
                "unknown transfer command {other}"
            ))),
        }
    }

    /// Whether this command introduces a file payload
    pub fn is_file(&self) -> bool {
        matches!(
            self,
            Self::File | Self::EnableEncryption | Self::DisableEncryption
        )
    }
}

/// Sub-commands carried in a structured record under [`TransferCommand::Other`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferSubCommand {
    /// The sender already pushed a file to a URL and reports the outcome
    UploadUrl,
    /// The sender proposes a reuse list; the receiver answers which files
    /// it already holds
    ReuseInfo,
    /// The sender asks the receiver to sign a list of object-store URLs
    SignUrls,
}

impl TransferSubCommand {
    /// Numeric wire code of this sub-command
    pub fn code(&self) -> i64 {
        match self {
            Self::UploadUrl => 7,
            Self::ReuseInfo => 8,
            Self::SignUrls => 9,
        }
    }

    /// Decode a wire code, failing on anything unrecognised
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            7 => Ok(Self::UploadUrl),
            8 => Ok(Self::ReuseInfo),
            9 => Ok(Self::SignUrls),
            other => Err(Error::protocol(format!(
                "unknown transfer sub-command {other}"
            ))),
        }
    }

    /// Whether the receiver must answer this sub-command with a response
    /// record
    pub fn wants_response(&self) -> bool {
        matches!(self, Self::ReuseInfo | Self::SignUrls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_are_frozen() {
        assert_eq!(TransferCommand::Finished.code(), 0);
        assert_eq!(TransferCommand::File.code(), 1);
        assert_eq!(TransferCommand::EnableEncryption.code(), 2);
        assert_eq!(TransferCommand::DisableEncryption.code(), 3);
        assert_eq!(TransferCommand::DelegateCredential.code(), 4);
        assert_eq!(TransferCommand::DownloadUrl.code(), 5);
        assert_eq!(TransferCommand::Mkdir.code(), 6);
        assert_eq!(TransferCommand::Other.code(), 999);
    }

    #[test]
    fn test_subcommand_codes_are_frozen() {
        assert_eq!(TransferSubCommand::UploadUrl.code(), 7);
        assert_eq!(TransferSubCommand::ReuseInfo.code(), 8);
        assert_eq!(TransferSubCommand::SignUrls.code(), 9);
    }

    #[test]
    fn test_round_trip_and_rejection() {
        for code in [0, 1, 2, 3, 4, 5, 6, 999] {
            assert_eq!(TransferCommand::from_code(code).unwrap().code(), code);
        }
        assert!(TransferCommand::from_code(7).is_err());
        assert!(TransferSubCommand::from_code(999).is_err());
    }

    #[test]
    fn test_response_requirement() {
        assert!(!TransferSubCommand::UploadUrl.wants_response());
        assert!(TransferSubCommand::ReuseInfo.wants_response());
        assert!(TransferSubCommand::SignUrls.wants_response());
    }
}

//! CLI exit code registry.
//!
//! Exit codes are part of the shell contract: scripts branch on them.
//!
//! | Code | Meaning                                                   |
//! |------|-----------------------------------------------------------|
//! | 0    | Success                                                   |
//! | 1    | General error (unspecified)                               |
//! | 2    | Usage error (bad arguments, missing sources section)      |
//! | 3    | Invalid config (TOML parse or validation failure)         |
//! | 4    | Runtime error (file IO, CSV decode, bad input data)       |
//! | 5    | Estimator did not converge (`--fail-on-nonconvergence`)   |
//! | 6    | Persisted model was fit under a different field schema    |

use reclink_linkage::LinkError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments or a config that cannot drive the command.
pub const EXIT_USAGE: u8 = 2;

/// Config failed to parse or validate.
pub const EXIT_INVALID_CONFIG: u8 = 3;

/// IO, CSV decode, duplicate ids and other input-data failures.
pub const EXIT_RUNTIME: u8 = 4;

/// Estimator stopped without converging and the caller asked to fail on it.
pub const EXIT_NOT_CONVERGED: u8 = 5;

/// `--load-model` parameters do not match the config's comparison schema.
pub const EXIT_CONFIG_MISMATCH: u8 = 6;

/// Map an engine error to its exit code.
pub fn link_exit_code(err: &LinkError) -> u8 {
    match err {
        LinkError::ConfigParse(_) | LinkError::ConfigValidation(_) => EXIT_INVALID_CONFIG,
        LinkError::ConfigurationMismatch { .. } => EXIT_CONFIG_MISMATCH,
        LinkError::MissingColumn { .. }
        | LinkError::DuplicateRecordId { .. }
        | LinkError::Io(_)
        | LinkError::Serialization(_) => EXIT_RUNTIME,
        LinkError::AmbiguousResolution { .. } => EXIT_ERROR,
    }
}

//! Input validation for scan requests.
//!
//! Arguments are passed to the scanner verbatim, so everything that could
//! reach a shell, read or write local files, or be mistaken for a flag is
//! rejected before any execution attempt is made. Validation is pure.

use thiserror::Error;
use tracing::debug;

/// Characters that are never allowed in a target or argument.
const METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}', '<', '>', '\n', '\r'];

/// Long options that read or write local files.
///
/// A token matches with any number of leading dashes and any `=value`
/// removed, either exactly or as an abbreviation of at least
/// [`MIN_ABBREVIATION`] characters, since the scanner accepts both.
const DENIED_LONG_OPTIONS: &[&str] = &[
    "script-args",
    "script-args-file",
    "datadir",
    "resume",
    "excludefile",
    "servicedb",
    "versiondb",
];

/// Allowed options whose names begin a denied one. An exact name is never
/// read as an abbreviation.
const ALLOWED_PREFIX_OPTIONS: &[&str] = &["script", "exclude", "version", "data"];

const MIN_ABBREVIATION: usize = 3;

/// Input-list and output-to-file flags, lowercased.
///
/// After one dash they also match with an attached value (`-oN/tmp/x`).
/// After two dashes only the bare name or `--oN=value` matches.
const FILE_FLAGS: &[&str] = &["il", "on", "ox", "og", "oa", "os", "om"];

/// Scan modes that need raw-socket privileges.
const RAW_SOCKET_FLAGS: &[&str] = &[
    "-sS", "-sU", "-sA", "-sW", "-sM", "-sN", "-sF", "-sX", "-sY", "-sZ", "-sO", "-O", "-A",
];

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("target must not be empty")]
    EmptyTarget,

    #[error("target '{0}' must not start with '-'")]
    TargetLooksLikeFlag(String),

    #[error("{field} contains blocked character {character:?}")]
    Metacharacter { field: String, character: char },

    #[error("argument {argument:?} is not well-formed: unbalanced quotes or trailing escape")]
    Unparseable { argument: String },

    #[error("blocked flag '{0}'")]
    DeniedFlag(String),
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInput {
    pub target: String,
    pub arguments: Vec<String>,
    /// Whether the scan mode needs raw-socket privileges.
    pub requires_raw_socket: bool,
}

/// Checks targets and argument lists before execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a target and its argument list.
    pub fn validate(
        &self,
        target: &str,
        arguments: &[String],
    ) -> Result<ValidatedInput, ValidationError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ValidationError::EmptyTarget);
        }
        check_metacharacters("target", target)?;
        if target.starts_with('-') {
            return Err(ValidationError::TargetLooksLikeFlag(target.to_string()));
        }

        let mut requires_raw_socket = false;
        for (i, argument) in arguments.iter().enumerate() {
            check_metacharacters(&format!("argument {}", i + 1), argument)?;

            let tokens = shlex::split(argument).ok_or_else(|| ValidationError::Unparseable {
                argument: argument.clone(),
            })?;

            for token in &tokens {
                check_denied(token)?;
                requires_raw_socket |= RAW_SOCKET_FLAGS.contains(&token.as_str());
            }
        }

        debug!(target = %target, arguments = ?arguments, requires_raw_socket, "Scan input validated");

        Ok(ValidatedInput {
            target: target.to_string(),
            arguments: arguments.to_vec(),
            requires_raw_socket,
        })
    }
}

fn check_metacharacters(field: &str, value: &str) -> Result<(), ValidationError> {
    match value.chars().find(|c| METACHARACTERS.contains(c)) {
        Some(character) => Err(ValidationError::Metacharacter {
            field: field.to_string(),
            character,
        }),
        None => Ok(()),
    }
}

fn check_denied(token: &str) -> Result<(), ValidationError> {
    let lowered = token.to_lowercase();
    let flag = lowered.split('=').next().unwrap_or_default();
    if !flag.starts_with('-') {
        return Ok(());
    }

    let bare = flag.trim_start_matches('-');
    let file_flag = if flag.starts_with("--") {
        FILE_FLAGS.contains(&bare)
    } else {
        FILE_FLAGS.iter().any(|f| bare.starts_with(f))
    };

    if file_flag || is_denied_long(bare) {
        return Err(ValidationError::DeniedFlag(token.to_string()));
    }
    Ok(())
}

/// A denied long option, spelled out or abbreviated.
fn is_denied_long(bare: &str) -> bool {
    if ALLOWED_PREFIX_OPTIONS.contains(&bare) {
        return false;
    }
    DENIED_LONG_OPTIONS
        .iter()
        .any(|name| *name == bare || (bare.len() >= MIN_ABBREVIATION && name.starts_with(bare)))
}

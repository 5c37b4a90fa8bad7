//! Closed table of provisioning result codes.
//!
//! Every code is bound to exactly one [`Severity`] by an explicit table row.
//! Severity is never derived from the numeric value: codes were added out of
//! order and the numeric ranges do not line up with severity classes.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::request::RequestStatus;

/// Severity class of a code. Decides which request status the code may drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Complete,
    Err,
    Warn,
    CompleteWithErr,
}

impl Severity {
    /// Tie-break order within one polling cycle: `ERR > COMPLETE_WITH_ERR > WARN`.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Complete => 0,
            Severity::Warn => 1,
            Severity::CompleteWithErr => 2,
            Severity::Err => 3,
        }
    }

    /// Request status a code of this severity drives.
    pub fn status(self) -> RequestStatus {
        match self {
            Severity::Complete => RequestStatus::Complete,
            Severity::Err => RequestStatus::Error,
            Severity::Warn => RequestStatus::Warning,
            Severity::CompleteWithErr => RequestStatus::CompleteWithError,
        }
    }
}

/// One row of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: ProvCode,
    pub value: u16,
    pub severity: Severity,
    /// Message with at most one `{}` detail slot.
    pub template: &'static str,
}

macro_rules! prov_codes {
    ($($variant:ident = $value:literal, $name:literal, $severity:ident, $template:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum ProvCode {
            $(#[serde(rename = $name)] $variant,)*
        }

        impl ProvCode {
            pub const ALL: &'static [ProvCode] = &[$(ProvCode::$variant,)*];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(ProvCode::$variant => $name,)*
                }
            }
        }

        /// The table the process-wide registry is built from.
        pub const TABLE: &[ErrorCode] = &[
            $(ErrorCode {
                code: ProvCode::$variant,
                value: $value,
                severity: Severity::$severity,
                template: $template,
            },)*
        ];
    };
}

prov_codes! {
    Ok = 0, "OK", Complete, "The request completed successfully. {}";
    ErrInner = 1, "ERR_INNER", Err, "Internal error {}.";
    Empty = 2, "EMPTY", Warn, "Received an empty input or response {}.";
    NotExistFile = 3, "NOT_EXIST_FILE", Err, "The file {} does not exist.";
    BadJsonFile = 4, "BAD_JSON_FILE", Err, "The file {} is not valid JSON.";
    UnsupportedApi = 5, "UNSUPPORTED_API", Err, "The API {} is not supported.";
    BadTemplate = 6, "BAD_TEMPLATE", Err, "The template {} is malformed.";
    NotExistTemplate = 7, "NOT_EXIST_TEMPLATE", Err, "The template {} does not exist.";
    BadNodeCount = 8, "BAD_NODE_COUNT", Err, "The requested node count {} is invalid.";
    ErrBackendResponse = 9, "ERR_BACKEND_RESPONSE", Warn, "The backend returned an error {}.";
    UnrecognizedBackendResponse = 10, "UNRECOGNIZED_BACKEND_RESPONSE", Warn, "The backend response {} is not recognized.";
    ErrBackendRequest = 11, "ERR_BACKEND_REQUEST", Warn, "Failed to send the request to the backend {}.";
    UnsupportedReq = 12, "UNSUPPORTED_REQ", CompleteWithErr, "The request {} is not supported.";
    ErrBackendNode = 13, "ERR_BACKEND_NODE", CompleteWithErr, "The backend reported failed nodes {}.";
    ErrNodeCreation = 14, "ERR_NODE_CREATION", CompleteWithErr, "Failed to create nodes {}.";
    ErrNodeTermination = 15, "ERR_NODE_TERMINATION", CompleteWithErr, "Failed to terminate nodes {}.";
    BadOption = 16, "BAD_OPTION", Err, "The option {} is invalid.";
    UnrecognizedJson = 17, "UNRECOGNIZED_JSON", Warn, "The input {} is not recognized.";
    ErrReadFile = 18, "ERR_READ_FILE", Warn, "Failed to read the file {}.";
    ErrExecApi = 19, "ERR_EXEC_API", Warn, "Failed to execute the API {}.";
    NullDataDir = 20, "NULL_DATA_DIR", Warn, "The data directory is not set {}.";
    NullConfDir = 21, "NULL_CONF_DIR", Warn, "The configuration directory is not set {}.";
    ErrCreateFile = 22, "ERR_CREATE_FILE", Warn, "Failed to create the file {}.";
    NotFoundApi = 23, "NOT_FOUND_API", Warn, "The API {} was not found.";
    CreationTimeout = 24, "CREATION_TIMEOUT", CompleteWithErr, "Node creation timed out {}.";
    TerminationTimeout = 25, "TERMINATION_TIMEOUT", CompleteWithErr, "Node termination timed out {}.";
    NotExistNode = 26, "NOT_EXIST_NODE", CompleteWithErr, "The nodes {} do not exist on the backend.";
    RejectedByBackend = 27, "REJECTED_BY_BACKEND", Err, "The backend rejected the request {}.";
}

impl fmt::Display for ProvCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable code → severity → message lookup, built once per process.
#[derive(Debug)]
pub struct Registry {
    entries: HashMap<ProvCode, ErrorCode>,
    by_value: HashMap<u16, ProvCode>,
}

static GLOBAL: LazyLock<Result<Registry, String>> =
    LazyLock::new(|| Registry::build(TABLE).map_err(|e| e.to_string()));

impl Registry {
    /// Validate a table and index it both ways.
    pub fn build(table: &[ErrorCode]) -> Result<Self, BrokerError> {
        let mut entries = HashMap::with_capacity(table.len());
        let mut by_value = HashMap::with_capacity(table.len());
        for row in table {
            if entries.insert(row.code, *row).is_some() {
                return Err(BrokerError::RegistryIntegrity(format!("{} listed twice", row.code)));
            }
            if let Some(other) = by_value.insert(row.value, row.code) {
                return Err(BrokerError::RegistryIntegrity(format!(
                    "{} and {} share value {}",
                    other, row.code, row.value
                )));
            }
            if row.template.matches("{}").count() > 1 {
                return Err(BrokerError::RegistryIntegrity(format!(
                    "{} has more than one detail slot",
                    row.code
                )));
            }
        }
        if let Some(missing) = ProvCode::ALL.iter().find(|c| !entries.contains_key(c)) {
            return Err(BrokerError::RegistryIntegrity(format!("{} has no entry", missing)));
        }
        Ok(Registry { entries, by_value })
    }

    /// The process-wide registry. Fails only if the built-in table is malformed.
    pub fn global() -> Result<&'static Registry, BrokerError> {
        GLOBAL.as_ref().map_err(|e| BrokerError::RegistryIntegrity(e.clone()))
    }

    /// Total over [`ProvCode`]: `build` refuses tables with missing codes.
    pub fn lookup(&self, code: ProvCode) -> &ErrorCode {
        &self.entries[&code]
    }

    pub fn by_value(&self, value: u16) -> Option<&ErrorCode> {
        self.by_value.get(&value).map(|code| self.lookup(*code))
    }

    pub fn severity(&self, code: ProvCode) -> Severity {
        self.lookup(code).severity
    }

    /// Resolve a code's template, filling the detail slot if one is given.
    pub fn message(&self, code: ProvCode, detail: Option<&str>) -> String {
        let filled = self.lookup(code).template.replacen("{}", detail.unwrap_or(""), 1);
        let mut out = filled.split_whitespace().collect::<Vec<_>>().join(" ");
        for mark in [".", ","] {
            out = out.replace(&format!(" {}", mark), mark);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_is_total() {
        let registry = Registry::global().unwrap();
        for code in ProvCode::ALL {
            assert_eq!(registry.lookup(*code).code, *code);
        }
        assert_eq!(TABLE.len(), ProvCode::ALL.len());
    }

    #[test]
    fn severities_follow_the_table() {
        let registry = Registry::global().unwrap();
        assert_eq!(registry.severity(ProvCode::Ok), Severity::Complete);
        assert_eq!(registry.severity(ProvCode::NotExistTemplate), Severity::Err);
        assert_eq!(registry.severity(ProvCode::BadNodeCount), Severity::Err);
        assert_eq!(registry.severity(ProvCode::UnrecognizedBackendResponse), Severity::Warn);
        assert_eq!(registry.severity(ProvCode::CreationTimeout), Severity::CompleteWithErr);
        assert_eq!(registry.severity(ProvCode::TerminationTimeout), Severity::CompleteWithErr);
    }

    #[test]
    fn err_codes_never_complete() {
        let registry = Registry::global().unwrap();
        for code in ProvCode::ALL {
            if registry.severity(*code) == Severity::Err {
                assert_eq!(registry.severity(*code).status(), RequestStatus::Error);
            }
        }
    }

    #[test]
    fn lookup_by_value_matches_code() {
        let registry = Registry::global().unwrap();
        assert_eq!(registry.by_value(24).map(|e| e.code), Some(ProvCode::CreationTimeout));
        assert_eq!(registry.by_value(7).map(|e| e.code), Some(ProvCode::NotExistTemplate));
        assert!(registry.by_value(999).is_none());
    }

    #[test]
    fn message_fills_or_drops_detail() {
        let registry = Registry::global().unwrap();
        assert_eq!(
            registry.message(ProvCode::NotExistTemplate, Some("gpu-large")),
            "The template gpu-large does not exist."
        );
        assert_eq!(
            registry.message(ProvCode::NotExistTemplate, None),
            "The template does not exist."
        );
        assert_eq!(registry.message(ProvCode::ErrInner, None), "Internal error.");
    }

    #[test]
    fn duplicate_value_is_rejected() {
        let mut table = TABLE.to_vec();
        table[1].value = 0;
        match Registry::build(&table) {
            Err(BrokerError::RegistryIntegrity(msg)) => assert!(msg.contains("share value 0")),
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn missing_code_is_rejected() {
        let table: Vec<ErrorCode> = TABLE.iter().copied().filter(|e| e.code != ProvCode::Empty).collect();
        assert!(matches!(Registry::build(&table), Err(BrokerError::RegistryIntegrity(_))));
    }

    #[test]
    fn codes_serialize_by_name() {
        let json = serde_json::to_string(&ProvCode::CreationTimeout).unwrap();
        assert_eq!(json, "\"CREATION_TIMEOUT\"");
        let back: ProvCode = serde_json::from_str("\"NOT_EXIST_TEMPLATE\"").unwrap();
        assert_eq!(back, ProvCode::NotExistTemplate);
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {name} not found in {scope}, available are:\n{}", available.join("\n"))]
    NotFound {
        kind: &'static str,
        name: String,
        scope: String,
        available: Vec<String>,
    },

    #[error("{target} is already patched")]
    AlreadyPatched { target: String },

    #[error("Structural corruption: {0}")]
    StructuralCorruption(String),

    #[error("Unresolved symbol {symbol}: {reason}")]
    UnresolvedSymbol { symbol: String, reason: String },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Patch {script} failed on {target}: {source}")]
    PatchFailed {
        script: String,
        target: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Invalid module format: {0}")]
    InvalidFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn not_found<I, S>(
        kind: &'static str,
        name: impl Into<String>,
        scope: impl Into<String>,
        available: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Error::NotFound {
            kind,
            name: name.into(),
            scope: scope.into(),
            available: available.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Error::StructuralCorruption(message.into())
    }

    /// Innermost error, looking through [`Error::PatchFailed`].
    pub fn root(&self) -> &Error {
        match self {
            Error::PatchFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is a "file not found" error
    pub fn is_file_not_found(&self) -> bool {
        matches!(self.root(), Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_already_patched(&self) -> bool {
        matches!(self.root(), Error::AlreadyPatched { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self.root(), Error::StructuralCorruption(_))
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self.root(), Error::UnresolvedSymbol { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_file_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::Io(io_err);
        assert!(err.is_file_not_found());

        let other_io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err2 = Error::Io(other_io_err);
        assert!(!err2.is_file_not_found());
    }

    #[test]
    fn test_not_found_lists_siblings() {
        let err = Error::not_found("Method", "Draw", "Game.Main", ["Update", "Initialize"]);
        let message = err.to_string();
        assert!(message.contains("Method Draw not found in Game.Main"));
        assert!(message.contains("Update\nInitialize"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_kind_helpers() {
        let err = Error::AlreadyPatched {
            target: "Game.Main::Draw".to_string(),
        };
        assert!(err.is_already_patched());
        assert!(!err.is_corruption());
        assert!(Error::corruption("dangling").is_corruption());
    }

    #[test]
    fn test_patch_failed_keeps_root_kind() {
        let err = Error::PatchFailed {
            script: "Main".to_string(),
            target: "Terraria.Main::DrawVersionNumber".to_string(),
            source: Box::new(Error::AlreadyPatched {
                target: "Terraria.Main::DrawVersionNumber".to_string(),
            }),
        };
        assert!(err.is_already_patched());
        assert!(matches!(err.root(), Error::AlreadyPatched { .. }));
        assert!(err.to_string().starts_with("Patch Main failed on Terraria.Main::DrawVersionNumber"));
    }
}

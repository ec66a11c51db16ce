//! Operational status reporting.

/// Operational status of the tokenization service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Service fully operational.
    Operational,
    /// Storage probe failed.
    InoperativeDb,
    /// Crypto provider probe failed.
    InoperativeCrypto,
}

impl Status {
    /// Short result text.
    #[must_use]
    pub const fn text(self) -> &'static str {
        match self {
            Self::Operational => "OPERATIONAL",
            Self::InoperativeDb | Self::InoperativeCrypto => "INOPERATIVE",
        }
    }

    /// Human-readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Operational => "Operational",
            Self::InoperativeDb => "Inoperative: database failure",
            Self::InoperativeCrypto => "Inoperative: encryption failure",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

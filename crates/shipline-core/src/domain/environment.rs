//! Target environments and their deployment policy.

use serde::{Deserialize, Serialize};

/// Promotion tier of an environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Dev,
    Qa,
    Uat,
    Prod,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Dev => "dev",
            Tier::Qa => "qa",
            Tier::Uat => "uat",
            Tier::Prod => "prod",
        };
        f.write_str(s)
    }
}

/// Tests the platform must run as part of a deploy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestLevel {
    #[default]
    None,
    Local,
    Full,
}

impl TestLevel {
    /// The value the platform CLI expects for its test-level flag.
    pub fn platform_flag(&self) -> &'static str {
        match self {
            TestLevel::None => "NoTestRun",
            TestLevel::Local => "RunLocalTests",
            TestLevel::Full => "RunAllTestsInOrg",
        }
    }
}

impl std::fmt::Display for TestLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestLevel::None => "none",
            TestLevel::Local => "local",
            TestLevel::Full => "full",
        };
        f.write_str(s)
    }
}

/// Opaque handle the external command resolves to real credentials
/// (for example an org alias). Never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A named deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Unique identifier, e.g. `"qa"`.
    pub id: String,
    pub tier: Tier,
    pub credential: CredentialRef,
    pub test_level: TestLevel,
    /// Stages targeting this environment need an explicit operator approval.
    pub approval_required: bool,
    /// Informational refresh schedule, e.g. `"weekly"`.
    pub refresh_cadence: Option<String>,
}

impl Environment {
    pub fn new(id: impl Into<String>, tier: Tier, credential: CredentialRef) -> Self {
        Self {
            id: id.into(),
            tier,
            credential,
            test_level: TestLevel::None,
            approval_required: false,
            refresh_cadence: None,
        }
    }

    pub fn with_test_level(mut self, level: TestLevel) -> Self {
        self.test_level = level;
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }

    pub fn with_refresh_cadence(mut self, cadence: impl Into<String>) -> Self {
        self.refresh_cadence = Some(cadence.into());
        self
    }
}

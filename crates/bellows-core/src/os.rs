use serde::{Deserialize, Serialize};

/// Operating system family a runner image boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
    #[serde(rename = "macos")]
    MacOs,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::MacOs => "macos",
        }
    }
}

impl std::str::FromStr for OsType {
    type Err = crate::error::BellowsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            "macos" | "osx" => Ok(Self::MacOs),
            other => Err(crate::error::BellowsError::BadRequest(format!(
                "unknown OS type: {}",
                other
            ))),
        }
    }
}

/// CPU architecture a runner image targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsArch {
    Amd64,
    Arm64,
    Arm,
}

impl OsArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Arm => "arm",
        }
    }

    /// The architecture name the runner application downloads use.
    pub fn runner_download_arch(&self) -> &'static str {
        match self {
            Self::Amd64 => "x64",
            Self::Arm64 => "arm64",
            Self::Arm => "arm",
        }
    }
}

impl std::str::FromStr for OsArch {
    type Err = crate::error::BellowsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x64" | "x86_64" => Ok(Self::Amd64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "arm" => Ok(Self::Arm),
            other => Err(crate::error::BellowsError::BadRequest(format!(
                "unknown OS arch: {}",
                other
            ))),
        }
    }
}

use serde::{Deserialize, Serialize};

/// One downloadable build of the runner agent application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerApplicationDownload {
    pub os: String,
    pub architecture: String,
    pub download_url: String,
    pub filename: String,
    #[serde(default)]
    pub sha256_checksum: Option<String>,
    #[serde(default)]
    pub temp_download_token: Option<String>,
}

/// Pick the download matching an instance's OS and architecture.
pub fn download_for(
    tools: &[RunnerApplicationDownload],
    os: crate::os::OsType,
    arch: crate::os::OsArch,
) -> Option<&RunnerApplicationDownload> {
    tools
        .iter()
        .find(|t| t.os == os.as_str() && t.architecture == arch.runner_download_arch())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{OsArch, OsType};

    fn tool(os: &str, arch: &str) -> RunnerApplicationDownload {
        RunnerApplicationDownload {
            os: os.to_string(),
            architecture: arch.to_string(),
            download_url: format!("https://example.com/runner-{}-{}.tar.gz", os, arch),
            filename: format!("runner-{}-{}.tar.gz", os, arch),
            sha256_checksum: None,
            temp_download_token: None,
        }
    }

    #[test]
    fn test_download_for_matches_runner_arch_names() {
        let tools = vec![tool("linux", "x64"), tool("linux", "arm64"), tool("win", "x64")];
        let found = download_for(&tools, OsType::Linux, OsArch::Amd64).unwrap();
        assert_eq!(found.architecture, "x64");
        assert!(download_for(&tools, OsType::MacOs, OsArch::Amd64).is_none());
    }
}

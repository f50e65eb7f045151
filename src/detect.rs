//! Detects the command that starts a project's local service.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::errors::{RackError, Result};

pub const NPM_DEV_SCRIPT: &str = "dev:teamsfx";

#[derive(Debug, Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: std::collections::HashMap<String, String>,
}

/// Picks the run command for the project in `folder`.
///
/// A Node project needs a `dev:teamsfx` script. A folder with exactly one
/// `.csproj` runs through `func start` when it is an Azure Functions project
/// and `dotnet run` otherwise. Mixed or unrecognised layouts are an error.
pub fn detect_run_command(folder: &Path) -> Result<String> {
    let has_package_json = folder.join("package.json").is_file();
    let csprojs = csproj_files(folder)?;
    let single_csproj = csprojs.len() == 1;

    let command = match (has_package_json, single_csproj) {
        (true, false) => {
            let raw = std::fs::read_to_string(folder.join("package.json"))?;
            let package: PackageJson = serde_json::from_str(&raw)
                .map_err(|err| RackError::Config(format!("invalid package.json: {err}")))?;
            package
                .scripts
                .contains_key(NPM_DEV_SCRIPT)
                .then(|| format!("npm run {NPM_DEV_SCRIPT}"))
        }
        (false, true) => {
            let content = std::fs::read_to_string(folder.join(&csprojs[0]))?;
            if is_functions_project(&content) {
                Some("func start".to_string())
            } else {
                Some("dotnet run".to_string())
            }
        }
        _ => None,
    };

    match command {
        Some(command) => {
            debug!(folder = %folder.display(), command = %command, "detected run command");
            Ok(command)
        }
        None => Err(RackError::Config(format!(
            "cannot detect a run command in {}; pass --run-command",
            folder.display()
        ))),
    }
}

fn csproj_files(folder: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        let is_csproj = Path::new(&name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csproj"));
        if is_csproj {
            files.push(name);
        }
    }
    Ok(files)
}

fn is_functions_project(csproj: &str) -> bool {
    let matches = |pattern: &str| Regex::new(pattern).is_ok_and(|re| re.is_match(csproj));
    matches(r#"(?i)sdk\s*=\s*"\s*microsoft\.net\.sdk\s*""#)
        && matches(r#"(?i)packagereference.*=\s*"\s*microsoft\.net\.sdk\.functions\s*""#)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FUNCTIONS_CSPROJ: &str = r#"<Project Sdk="Microsoft.NET.Sdk">
  <ItemGroup>
    <PackageReference Include="Microsoft.NET.Sdk.Functions" Version="4.1.1" />
  </ItemGroup>
</Project>"#;

    #[test]
    fn node_project_uses_dev_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev:teamsfx": "env-cmd npm run dev"}}"#,
        )
        .unwrap();
        assert_eq!(detect_run_command(dir.path()).unwrap(), "npm run dev:teamsfx");
    }

    #[test]
    fn node_project_without_dev_script_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"scripts": {"start": "node ."}}"#).unwrap();
        assert!(matches!(detect_run_command(dir.path()), Err(RackError::Config(_))));
    }

    #[test]
    fn csproj_picks_func_or_dotnet() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Api.csproj"), FUNCTIONS_CSPROJ).unwrap();
        assert_eq!(detect_run_command(dir.path()).unwrap(), "func start");

        std::fs::write(
            dir.path().join("Api.csproj"),
            r#"<Project Sdk="Microsoft.NET.Sdk.Web"></Project>"#,
        )
        .unwrap();
        assert_eq!(detect_run_command(dir.path()).unwrap(), "dotnet run");
    }

    #[test]
    fn mixed_or_empty_folders_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_run_command(dir.path()).is_err());

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("App.CSPROJ"), FUNCTIONS_CSPROJ).unwrap();
        assert!(detect_run_command(dir.path()).is_err());
    }
}

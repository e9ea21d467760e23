//! Ephemeral tunnel config and credential files
//!
//! The supplied config text is rewritten for the selected driver and written
//! next to the application, together with an optional credential file that
//! the config references. Both files live exactly as long as the
//! [`ConfigArtifact`] value.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::driver::DriverKind;
use crate::error::ConfigError;

/// Username and password for the tunnel
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials count only when both parts are present
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Self::new(u, p)),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// First token of a config line, ignoring comments
fn directive(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with(';') {
        return None;
    }
    trimmed.split_whitespace().next()
}

fn argument(line: &str) -> Option<&str> {
    line.split_whitespace().nth(1)
}

/// Rewrite the user's config text for the selected driver
pub fn render_config(source: &str, kind: DriverKind, credential_path: Option<&Path>) -> String {
    let mut lines: Vec<String> = Vec::new();

    for line in source.lines() {
        let drop = match directive(line) {
            Some("client-cert-not-required") => true,
            Some("auth-user-pass") => credential_path.is_some(),
            Some("dev") => kind == DriverKind::Fast && argument(line) == Some("tap"),
            Some("windows-driver") | Some("dev-type") | Some("persist-tun") => kind == DriverKind::Fast,
            _ => false,
        };
        if drop {
            debug!("Dropping config line: {}", line.trim());
        } else {
            lines.push(line.to_string());
        }
    }

    if kind == DriverKind::Fast {
        let anchor = lines
            .iter()
            .position(|l| directive(l) == Some("dev") && argument(l) == Some("tun"))
            .or_else(|| lines.iter().position(|l| directive(l) == Some("remote")));
        let driver_line = "windows-driver wintun".to_string();
        match anchor {
            Some(pos) => lines.insert(pos + 1, driver_line),
            None => lines.push(driver_line),
        }
    }

    let mut rendered = lines.join("\n");
    if let Some(path) = credential_path {
        rendered.push_str(&format!("\nauth-user-pass \"{}\"", path.display()));
    }
    rendered.push('\n');
    rendered
}

/// The config/credential file pair of one connection
#[derive(Debug)]
pub struct ConfigArtifact {
    config_path: PathBuf,
    credential_path: Option<PathBuf>,
}

impl ConfigArtifact {
    /// Render and write the artifact files. Nothing is left behind on failure.
    pub async fn write(
        dir: &Path,
        config_file_name: &str,
        credential_file_name: &str,
        source: &str,
        kind: DriverKind,
        credentials: Option<&Credentials>,
    ) -> Result<Self, ConfigError> {
        ensure_directory_exists(dir).await?;

        let config_path = dir.join(config_file_name);
        let credential_path = match credentials {
            Some(credentials) => {
                let path = dir.join(credential_file_name);
                let content = format!("{}\n{}", credentials.username, credentials.password);
                if let Err(e) = write_secure(&path, &content).await {
                    delete_file(&path).await;
                    return Err(e);
                }
                Some(path)
            }
            None => None,
        };

        // From here on, dropping the value removes whatever was written
        let artifact = Self {
            config_path,
            credential_path,
        };

        let rendered = render_config(source, kind, artifact.credential_path.as_deref());
        write_secure(&artifact.config_path, &rendered).await?;
        debug!("Wrote tunnel config {:?}", artifact.config_path);

        Ok(artifact)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn credential_path(&self) -> Option<&Path> {
        self.credential_path.as_deref()
    }

    /// Delete both files
    pub async fn remove(self) {
        for path in self.paths() {
            delete_file(&path).await;
        }
    }

    fn paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.config_path.clone()];
        paths.extend(self.credential_path.clone());
        paths
    }
}

impl Drop for ConfigArtifact {
    fn drop(&mut self) {
        for path in self.paths() {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to delete {:?}: {}", path, e);
                }
            }
        }
    }
}

async fn ensure_directory_exists(path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| ConfigError::Unwritable {
                path: path.to_path_buf(),
                source: e,
            })?;
        debug!("Created directory: {:?}", path);
    }
    Ok(())
}

async fn write_secure(path: &Path, content: &str) -> Result<(), ConfigError> {
    let unwritable = |e| ConfigError::Unwritable {
        path: path.to_path_buf(),
        source: e,
    };

    tokio::fs::write(path, content).await.map_err(unwritable)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(unwritable)?;
    }

    Ok(())
}

async fn delete_file(path: &Path) {
    if path.exists() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Deleted {:?}", path),
            Err(e) => warn!("Failed to delete {:?}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "client\ndev tap\nremote 1.2.3.4 1194\nwindows-driver tap-windows6\npersist-tun\n# dev tap\nclient-cert-not-required\n";

    #[test]
    fn test_fast_driver_directives() {
        let rendered = render_config(SOURCE, DriverKind::Fast, None);
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(
            lines,
            vec!["client", "remote 1.2.3.4 1194", "windows-driver wintun", "# dev tap"]
        );
    }

    #[test]
    fn test_driver_directive_follows_dev_tun() {
        let rendered = render_config("remote 1.2.3.4 1194\ndev tun\nnobind", DriverKind::Fast, None);
        assert_eq!(
            rendered,
            "remote 1.2.3.4 1194\ndev tun\nwindows-driver wintun\nnobind\n"
        );
    }

    #[test]
    fn test_driver_directive_appended_without_anchor() {
        let rendered = render_config("client", DriverKind::Fast, None);
        assert_eq!(rendered, "client\nwindows-driver wintun\n");
    }

    #[test]
    fn test_legacy_driver_keeps_device_lines() {
        let rendered = render_config(SOURCE, DriverKind::Legacy, None);
        assert!(rendered.contains("dev tap"));
        assert!(rendered.contains("persist-tun"));
        assert!(!rendered.contains("client-cert-not-required"));
        assert!(!rendered.contains("wintun"));
    }

    #[test]
    fn test_credentials_reference_replaces_existing() {
        let path = Path::new("/opt/app/tunnelctl_auth.txt");
        let rendered = render_config("remote a 1\nauth-user-pass", DriverKind::Legacy, Some(path));
        assert_eq!(
            rendered,
            "remote a 1\nauth-user-pass \"/opt/app/tunnelctl_auth.txt\"\n"
        );
    }

    #[test]
    fn test_credentials_need_both_parts() {
        assert!(Credentials::from_parts(Some("u"), Some("p")).is_some());
        assert!(Credentials::from_parts(Some("u"), Some("")).is_none());
        assert!(Credentials::from_parts(None, Some("p")).is_none());
        assert!(!format!("{:?}", Credentials::new("u", "secret")).contains("secret"));
    }

    #[tokio::test]
    async fn test_artifact_pair_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = Credentials::new("u", "p");

        let artifact = ConfigArtifact::write(
            dir.path(),
            "tunnel.ovpn",
            "auth.txt",
            "remote 1.2.3.4 1194\ndev tun",
            DriverKind::Fast,
            Some(&credentials),
        )
        .await
        .unwrap();

        let config_path = artifact.config_path().to_path_buf();
        let credential_path = artifact.credential_path().unwrap().to_path_buf();
        assert_eq!(std::fs::read_to_string(&credential_path).unwrap(), "u\np");
        assert!(std::fs::read_to_string(&config_path)
            .unwrap()
            .contains("auth-user-pass"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&credential_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        artifact.remove().await;
        assert!(!config_path.exists());
        assert!(!credential_path.exists());
    }

    #[tokio::test]
    async fn test_artifact_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ConfigArtifact::write(
            dir.path(),
            "tunnel.ovpn",
            "auth.txt",
            "remote 1.2.3.4 1194",
            DriverKind::Legacy,
            None,
        )
        .await
        .unwrap();

        assert!(artifact.credential_path().is_none());
        assert!(!dir.path().join("auth.txt").exists());

        let config_path = artifact.config_path().to_path_buf();
        drop(artifact);
        assert!(!config_path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let err = ConfigArtifact::write(
            &blocker.join("sub"),
            "tunnel.ovpn",
            "auth.txt",
            "remote a 1",
            DriverKind::Fast,
            Some(&Credentials::new("u", "p")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConfigError::Unwritable { .. }));
    }
}

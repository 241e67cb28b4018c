//! GitHub backends: release asset downloads and source builds

use super::backend::{ensure_tool, exe_name, detect_tool, remove_path, PackageManager};
use super::command::{CommandRunner, CommandSpec};
use crate::package::{GitReference, InstallationMethod, PackageSource, LATEST};
use crate::types::LspError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("lspm/", env!("CARGO_PKG_VERSION"));

/// Archive formats recognised by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Archive {
    TarGz,
    Zip,
    Gzip,
    Plain,
}

impl Archive {
    fn detect(file_name: &str) -> Self {
        if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
            Self::TarGz
        } else if file_name.ends_with(".zip") {
            Self::Zip
        } else if file_name.ends_with(".gz") {
            Self::Gzip
        } else {
            Self::Plain
        }
    }
}

fn asset_file_name(url: &str) -> Option<&str> {
    url.rsplit('/').next().filter(|name| !name.is_empty())
}

pub struct GithubReleaseBackend {
    dir: PathBuf,
    runner: CommandRunner,
    /// Built on first download when not supplied
    client: Option<reqwest::Client>,
}

impl GithubReleaseBackend {
    pub fn new(dir: PathBuf, runner: CommandRunner) -> Self {
        Self {
            dir,
            runner,
            client: None,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), LspError> {
        let download_error = |reason: String| LspError::Download {
            url: url.to_string(),
            reason,
        };

        let client = match &self.client {
            Some(client) => client.clone(),
            None => reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .map_err(|e| download_error(e.to_string()))?,
        };

        self.runner.emit(format!("Downloading {}", url)).await;
        let mut response = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_error(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let cancel = self.runner.cancel_token();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(LspError::Cancelled),
                chunk = response.chunk() => chunk.map_err(|e| download_error(e.to_string()))?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(download_error("empty response body".to_string()));
        }
        self.runner.emit(format!("Downloaded {} bytes", written)).await;
        Ok(())
    }

    /// Unpack the downloaded asset in place.
    async fn unpack(&self, asset: &Path) -> Result<(), LspError> {
        let file_name = asset
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match Archive::detect(&file_name) {
            Archive::TarGz => {
                self.runner
                    .run(&CommandSpec::new("tar").arg("-xzf").arg(asset).arg("-C").arg(&self.dir))
                    .await?;
                remove_path(asset).await
            }
            Archive::Zip => {
                self.runner
                    .run(&CommandSpec::new("unzip").args(["-o", "-q"]).arg(asset).arg("-d").arg(&self.dir))
                    .await?;
                remove_path(asset).await
            }
            Archive::Gzip => {
                self.runner
                    .run(&CommandSpec::new("gzip").arg("-df").arg(asset))
                    .await?;
                make_executable(&asset.with_extension("")).await
            }
            Archive::Plain => make_executable(asset).await,
        }
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), LspError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), LspError> {
    Ok(())
}

#[async_trait]
impl PackageManager for GithubReleaseBackend {
    fn tool(&self) -> &'static str {
        "github"
    }

    async fn is_installed(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<(), LspError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn install(&self, method: &InstallationMethod) -> Result<(), LspError> {
        let InstallationMethod::BinaryDownload { source, url } = method else {
            return Err(LspError::UnsupportedSource(format!(
                "{} install is not a release download",
                method.label()
            )));
        };
        let file_name = asset_file_name(url)
            .ok_or_else(|| LspError::install_failed(&source.name, "asset URL has no file name"))?;
        info!("Installing {} from release asset {}", source.name, file_name);

        let asset = self.dir.join(file_name);
        self.download(url, &asset).await?;

        let size = tokio::fs::metadata(&asset).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(LspError::install_failed(&source.name, "downloaded asset is empty"));
        }
        self.unpack(&asset).await
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        self.dir.join(exe_name(name))
    }

    async fn cleanup(&self) -> Result<(), LspError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        // Only archives are partial artifacts; a previous install stays usable
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if matches!(Archive::detect(&name), Archive::TarGz | Archive::Zip | Archive::Gzip) {
                debug!("Removing partial download {}", name);
                remove_path(&entry.path()).await?;
            }
        }
        Ok(())
    }
}

/// Clones a repository and runs its build command.
pub struct GitSourceBackend {
    dir: PathBuf,
    runner: CommandRunner,
}

impl GitSourceBackend {
    pub fn new(dir: PathBuf, runner: CommandRunner) -> Self {
        Self { dir, runner }
    }

    fn checkout_dir(&self) -> PathBuf {
        self.dir.join("src")
    }

    fn git(&self) -> CommandSpec {
        CommandSpec::new("git").current_dir(self.checkout_dir())
    }

    async fn clone_source(&self, source: &PackageSource) -> Result<(), LspError> {
        let url = source
            .repository_url
            .as_deref()
            .ok_or_else(|| LspError::install_failed(&source.name, "no repository URL"))?;

        let clone = CommandSpec::new("git").arg("clone").current_dir(&self.dir);
        match &source.git_reference {
            Some(GitReference::Revision(rev)) => {
                self.runner.run(&clone.arg(url).arg("src")).await?;
                self.runner.run(&self.git().args(["checkout", "--detach"]).arg(rev)).await
            }
            Some(GitReference::Tag(tag)) if tag != LATEST => {
                self.runner
                    .run(&clone.args(["--depth", "1", "--branch"]).arg(tag).arg(url).arg("src"))
                    .await
            }
            _ => {
                self.runner
                    .run(&clone.args(["--depth", "1"]).arg(url).arg("src"))
                    .await
            }
        }
    }

    async fn verify(&self, source: &PackageSource) -> Result<(), LspError> {
        let quiet = CommandRunner::new(self.runner.cancel_token().clone());
        let (expected, found) = match &source.git_reference {
            Some(GitReference::Revision(rev)) => (
                rev.as_str(),
                quiet.capture(&self.git().args(["rev-parse", "HEAD"])).await?,
            ),
            Some(GitReference::Tag(tag)) if tag != LATEST => (
                tag.as_str(),
                quiet
                    .capture(&self.git().args(["describe", "--tags", "--exact-match"]))
                    .await?,
            ),
            _ => return Ok(()),
        };

        if found.trim() == expected {
            Ok(())
        } else {
            Err(LspError::install_failed(
                &source.name,
                format!("checked out {}, wanted {}", found.trim(), expected),
            ))
        }
    }
}

#[async_trait]
impl PackageManager for GitSourceBackend {
    fn tool(&self) -> &'static str {
        "git"
    }

    async fn is_installed(&self) -> bool {
        detect_tool("git", &["--version"], r"^git version \d").await
    }

    async fn initialize(&self) -> Result<(), LspError> {
        ensure_tool(self).await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        // A stale checkout would make the clone fail
        remove_path(&self.checkout_dir()).await
    }

    async fn install(&self, method: &InstallationMethod) -> Result<(), LspError> {
        let InstallationMethod::SourceBuild {
            source,
            build_command,
        } = method
        else {
            return Err(LspError::UnsupportedSource(format!(
                "{} install is not a source build",
                method.label()
            )));
        };
        info!("Building {} from source", source);

        self.clone_source(source).await?;
        self.verify(source).await?;
        self.runner
            .run(&CommandSpec::shell(build_command).current_dir(self.checkout_dir()))
            .await
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        self.checkout_dir().join(exe_name(name))
    }

    async fn cleanup(&self) -> Result<(), LspError> {
        remove_path(&self.checkout_dir()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_detection() {
        assert_eq!(Archive::detect("lua-language-server-3.10.6-linux-x64.tar.gz"), Archive::TarGz);
        assert_eq!(Archive::detect("server.tgz"), Archive::TarGz);
        assert_eq!(Archive::detect("server-win32.zip"), Archive::Zip);
        assert_eq!(Archive::detect("rust-analyzer-x86_64-unknown-linux-gnu.gz"), Archive::Gzip);
        assert_eq!(Archive::detect("marksman-linux-x64"), Archive::Plain);
    }

    #[test]
    fn test_asset_file_name() {
        assert_eq!(
            asset_file_name("https://github.com/artempyanykh/marksman/releases/download/2024-10-07/marksman-linux-x64"),
            Some("marksman-linux-x64")
        );
        assert_eq!(asset_file_name("https://example.com/"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unpack_gzip_marks_executable() {
        use std::os::unix::fs::PermissionsExt;
        if which::which("gzip").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("server");
        std::fs::write(&plain, "#!/bin/sh\n").unwrap();
        let status = std::process::Command::new("gzip").arg(&plain).status().unwrap();
        assert!(status.success());

        let backend = GithubReleaseBackend::new(dir.path().to_path_buf(), CommandRunner::default());
        backend.unpack(&dir.path().join("server.gz")).await.unwrap();

        let mode = std::fs::metadata(&plain).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert!(!dir.path().join("server.gz").exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_archives_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.tar.gz"), "partial").unwrap();
        std::fs::write(dir.path().join("server"), "binary").unwrap();

        let backend = GithubReleaseBackend::new(dir.path().to_path_buf(), CommandRunner::default());
        backend.cleanup().await.unwrap();
        assert!(!dir.path().join("server.tar.gz").exists());
        assert!(dir.path().join("server").exists());

        let missing = GithubReleaseBackend::new(dir.path().join("absent"), CommandRunner::default());
        missing.cleanup().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_source_build_from_local_repository() {
        if which::which("git").is_err() {
            return;
        }
        let upstream = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(["-c", "user.name=lspm", "-c", "user.email=lspm@localhost"])
                .args(args)
                .current_dir(upstream.path())
                .status()
                .unwrap();
            assert!(status.success());
        };
        git(&["init", "-q"]);
        std::fs::write(upstream.path().join("README"), "server").unwrap();
        git(&["add", "README"]);
        git(&["commit", "-q", "-m", "init"]);
        git(&["tag", "v1.0.0"]);

        let id = format!(
            "pkg:github/acme/server@v1.0.0?repository_url={}",
            upstream.path().display()
        );
        let source = crate::package::parse_package_id(&id).unwrap();
        let method = InstallationMethod::SourceBuild {
            source,
            build_command: "cp README server".to_string(),
        };

        let target = tempfile::tempdir().unwrap();
        let backend = GitSourceBackend::new(target.path().join("server"), CommandRunner::default());
        backend.initialize().await.unwrap();
        backend.install(&method).await.unwrap();
        assert!(backend.binary_path("server").exists());

        backend.cleanup().await.unwrap();
        assert!(!backend.binary_path("server").exists());
    }

    mod download {
        use super::*;
        use std::time::Duration;
        use tokio::io::AsyncReadExt;
        use tokio_util::sync::CancellationToken;

        /// Answer one request with `response`, then keep the connection open
        /// for `hold`.
        async fn serve_once(response: &'static [u8], hold: Duration) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                socket.write_all(response).await.unwrap();
                tokio::time::sleep(hold).await;
            });
            format!("http://{}/owner/tool/releases/download/v1/tool-linux-x64", addr)
        }

        fn backend(dir: &Path, cancel: CancellationToken) -> GithubReleaseBackend {
            let client = reqwest::Client::builder().no_proxy().build().unwrap();
            GithubReleaseBackend::new(dir.to_path_buf(), CommandRunner::new(cancel))
                .with_client(client)
        }

        fn method(url: String) -> InstallationMethod {
            InstallationMethod::BinaryDownload {
                source: crate::package::parse_package_id("pkg:github/owner/tool@v1").unwrap(),
                url,
            }
        }

        #[tokio::test]
        async fn test_http_error_is_download_error() {
            let dir = tempfile::tempdir().unwrap();
            let url = serve_once(
                b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                Duration::ZERO,
            )
            .await;

            let err = backend(dir.path(), CancellationToken::new())
                .install(&method(url.clone()))
                .await
                .unwrap_err();
            match err {
                LspError::Download { url: failed, reason } => {
                    assert_eq!(failed, url);
                    assert!(reason.contains("404"), "{}", reason);
                }
                other => panic!("unexpected error {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_empty_body_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let url = serve_once(
                b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                Duration::ZERO,
            )
            .await;

            let err = backend(dir.path(), CancellationToken::new())
                .install(&method(url))
                .await
                .unwrap_err();
            assert!(
                matches!(err, LspError::Download { ref reason, .. } if reason == "empty response body"),
                "{:?}",
                err
            );
        }

        #[cfg(unix)]
        #[tokio::test]
        async fn test_plain_asset_is_executable() {
            use std::os::unix::fs::PermissionsExt;
            let dir = tempfile::tempdir().unwrap();
            let url = serve_once(
                b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\nconnection: close\r\n\r\n#!/bin/sh\n",
                Duration::ZERO,
            )
            .await;

            let backend = backend(dir.path(), CancellationToken::new());
            backend.install(&method(url)).await.unwrap();
            let binary = backend.binary_path("tool-linux-x64");
            assert_eq!(std::fs::read(&binary).unwrap(), b"#!/bin/sh\n");
            let mode = std::fs::metadata(&binary).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }

        #[tokio::test]
        async fn test_cancel_during_stalled_body() {
            let dir = tempfile::tempdir().unwrap();
            let url = serve_once(
                b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\npartial",
                Duration::from_secs(30),
            )
            .await;
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    cancel.cancel();
                }
            });

            let result = tokio::time::timeout(
                Duration::from_secs(5),
                backend(dir.path(), cancel).install(&method(url)),
            )
            .await
            .unwrap();
            assert!(matches!(result, Err(LspError::Cancelled)), "{:?}", result);
        }
    }
}

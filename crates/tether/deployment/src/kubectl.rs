//! `kubectl`-backed applier.
//!
//! Manifests are piped to `kubectl apply -f -` / `kubectl delete -f -`. The
//! connection comes from a [`ClusterConnection`], usually translated from the
//! same `kube::Config` the agent's own client was built from, so the tool
//! talks to the cluster with the agent's identity.
//!
//! Credentials never reach the tool's argv: the connection is rendered into a
//! private kubeconfig in a scratch directory and passed with `--kubeconfig`.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::ExposeSecret;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::applier::Applier;
use crate::error::{DeploymentError, DeploymentResult};

/// Connection parameters passed to the tool on every call.
#[derive(Clone, Default)]
pub struct ClusterConnection {
    pub server: Option<String>,
    pub certificate_authority: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
    pub token: Option<String>,
    /// Read by the tool on every call; service-account tokens rotate.
    pub token_file: Option<PathBuf>,
    pub client_certificate: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ClusterConnection {
    /// Translate an authenticated client configuration.
    ///
    /// Inline certificate material is written below `scratch`, which must
    /// outlive the connection.
    pub fn from_kube_config(config: &kube::Config, scratch: &Path) -> DeploymentResult<Self> {
        let auth = &config.auth_info;
        let mut connection = ClusterConnection {
            server: Some(config.cluster_url.to_string()),
            insecure_skip_tls_verify: config.accept_invalid_certs,
            token: auth.token.as_ref().map(|t| t.expose_secret().to_string()),
            token_file: auth.token_file.as_ref().map(PathBuf::from),
            client_certificate: auth.client_certificate.as_ref().map(PathBuf::from),
            client_key: auth.client_key.as_ref().map(PathBuf::from),
            username: auth.username.clone(),
            password: auth.password.as_ref().map(|p| p.expose_secret().to_string()),
            ..Default::default()
        };

        if let Some(roots) = config.root_cert.as_ref().filter(|r| !r.is_empty()) {
            let pem: String = roots.iter().map(|der| der_to_pem(der)).collect();
            connection.certificate_authority = Some(write_secret(scratch, "ca.crt", pem.as_bytes())?);
        }

        if connection.client_certificate.is_none() {
            if let Some(data) = auth.client_certificate_data.as_deref() {
                let pem = decode_inline("client certificate", data)?;
                connection.client_certificate = Some(write_secret(scratch, "client.crt", &pem)?);
            }
        }

        if connection.client_key.is_none() {
            if let Some(data) = auth.client_key_data.as_ref() {
                let pem = decode_inline("client key", data.expose_secret())?;
                connection.client_key = Some(write_secret(scratch, "client.key", &pem)?);
            }
        }

        Ok(connection)
    }

    /// Kubeconfig document with one cluster, one user and a context
    /// selecting both. Only fields that are set are written.
    pub fn kubeconfig(&self) -> Value {
        let mut cluster = Map::new();
        if let Some(server) = &self.server {
            cluster.insert("server".into(), json!(server));
        }
        if let Some(ca) = &self.certificate_authority {
            cluster.insert("certificate-authority".into(), json!(ca.display().to_string()));
        }
        if self.insecure_skip_tls_verify {
            cluster.insert("insecure-skip-tls-verify".into(), json!(true));
        }

        let mut user = Map::new();
        let strings = [
            ("token", self.token.clone()),
            ("tokenFile", path_string(&self.token_file)),
            ("client-certificate", path_string(&self.client_certificate)),
            ("client-key", path_string(&self.client_key)),
            ("username", self.username.clone()),
            ("password", self.password.clone()),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                user.insert(key.into(), json!(value));
            }
        }

        json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": KUBECONFIG_NAME, "cluster": cluster }],
            "users": [{ "name": KUBECONFIG_NAME, "user": user }],
            "contexts": [{
                "name": KUBECONFIG_NAME,
                "context": { "cluster": KUBECONFIG_NAME, "user": KUBECONFIG_NAME },
            }],
            "current-context": KUBECONFIG_NAME,
        })
    }
}

const KUBECONFIG_NAME: &str = "tether";

fn path_string(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.display().to_string())
}

impl std::fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("server", &self.server)
            .field("certificate_authority", &self.certificate_authority)
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_file", &self.token_file)
            .field("client_certificate", &self.client_certificate)
            .field("client_key", &self.client_key)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn der_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

fn scratch_dir() -> DeploymentResult<TempDir> {
    Ok(tempfile::Builder::new().prefix("tether-kubectl").tempdir()?)
}

fn decode_inline(what: &str, data: &str) -> DeploymentResult<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| DeploymentError::ClusterConfig(format!("invalid inline {}: {}", what, e)))
}

/// Write a file readable by the owner only.
fn write_secret(dir: &Path, name: &str, contents: &[u8]) -> DeploymentResult<PathBuf> {
    let path = dir.join(name);
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(&path)?.write_all(contents)?;
    Ok(path)
}

/// Applier that shells out to `kubectl`.
#[derive(Debug)]
pub struct KubectlApplier {
    binary: PathBuf,
    timeout: Duration,
    kubeconfig: PathBuf,
    /// Holds the kubeconfig and every file it references.
    _scratch: TempDir,
}

impl KubectlApplier {
    pub fn new(connection: ClusterConnection) -> DeploymentResult<Self> {
        Self::with_scratch(&connection, scratch_dir()?)
    }

    /// Build from an authenticated client configuration.
    pub fn from_kube_config(config: &kube::Config) -> DeploymentResult<Self> {
        let scratch = scratch_dir()?;
        let connection = ClusterConnection::from_kube_config(config, scratch.path())?;
        Self::with_scratch(&connection, scratch)
    }

    fn with_scratch(connection: &ClusterConnection, scratch: TempDir) -> DeploymentResult<Self> {
        let document = serde_json::to_vec_pretty(&connection.kubeconfig())
            .map_err(|e| DeploymentError::ClusterConfig(format!("cannot render kubeconfig: {}", e)))?;
        let kubeconfig = write_secret(scratch.path(), "kubeconfig", &document)?;
        debug!(?connection, kubeconfig = %kubeconfig.display(), "kubectl connection prepared");

        Ok(Self {
            binary: PathBuf::from("kubectl"),
            timeout: Duration::from_secs(300),
            kubeconfig,
            _scratch: scratch,
        })
    }

    /// Kubeconfig passed to every call.
    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn tool(&self) -> String {
        self.binary.display().to_string()
    }

    #[instrument(skip(self, manifest), fields(bytes = manifest.len()))]
    async fn run(&self, verb: &str, namespace: &str, manifest: &str) -> DeploymentResult<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg(verb)
            .args(["-f", "-", "--namespace", namespace])
            .arg(format!("--kubeconfig={}", self.kubeconfig.display()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if verb == "delete" {
            command.arg("--ignore-not-found=true");
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take();

        // Feeding stdin counts against the timeout. Dropping the child on
        // expiry kills it.
        let finished = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(manifest.as_bytes()).await {
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                        warn!("kubectl exited before reading the whole manifest");
                    }
                    written => written?,
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, finished)
            .await
            .map_err(|_| DeploymentError::ToolTimeout {
                tool: self.tool(),
                timeout_secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(DeploymentError::Tool {
                tool: self.tool(),
                exit: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "kubectl {} finished",
            verb
        );
        Ok(())
    }
}

#[async_trait]
impl Applier for KubectlApplier {
    async fn apply(&self, namespace: &str, manifest: &str) -> DeploymentResult<()> {
        self.run("apply", namespace, manifest).await
    }

    async fn remove(&self, namespace: &str, manifest: &str) -> DeploymentResult<()> {
        self.run("delete", namespace, manifest).await
    }

    fn name(&self) -> &str {
        "kubectl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubeconfig_from_connection() {
        let connection = ClusterConnection {
            server: Some("https://10.0.0.1:6443".into()),
            certificate_authority: Some("/var/run/ca.crt".into()),
            token_file: Some("/var/run/secrets/token".into()),
            username: Some("admin".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        };

        let config = connection.kubeconfig();
        assert_eq!(config["current-context"], "tether");
        assert_eq!(
            config["clusters"][0]["cluster"],
            json!({
                "server": "https://10.0.0.1:6443",
                "certificate-authority": "/var/run/ca.crt",
            })
        );
        assert_eq!(
            config["users"][0]["user"],
            json!({
                "tokenFile": "/var/run/secrets/token",
                "username": "admin",
                "password": "hunter2",
            })
        );
        assert_eq!(
            config["contexts"][0]["context"],
            json!({ "cluster": "tether", "user": "tether" })
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_kubeconfig_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let applier = KubectlApplier::new(ClusterConnection {
            token: Some("s3cr3t".into()),
            ..Default::default()
        })
        .unwrap();

        let mode = std::fs::metadata(applier.kubeconfig()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let written: Value =
            serde_json::from_slice(&std::fs::read(applier.kubeconfig()).unwrap()).unwrap();
        assert_eq!(written["users"][0]["user"]["token"], "s3cr3t");
    }

    #[test]
    fn test_translate_kube_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = kube::Config::new("https://10.0.0.1:6443".parse().unwrap());
        config.accept_invalid_certs = true;
        config.root_cert = Some(vec![vec![0x30, 0x82, 0x01, 0x0a]]);
        config.auth_info.token_file = Some("/var/run/secrets/token".into());
        config.auth_info.client_certificate_data = Some(STANDARD.encode("CERT PEM"));

        let connection = ClusterConnection::from_kube_config(&config, dir.path()).unwrap();

        assert_eq!(connection.server.as_deref(), Some("https://10.0.0.1:6443/"));
        assert!(connection.insecure_skip_tls_verify);
        assert_eq!(
            connection.token_file.as_deref(),
            Some(Path::new("/var/run/secrets/token"))
        );

        let ca = std::fs::read_to_string(connection.certificate_authority.unwrap()).unwrap();
        assert!(ca.starts_with("-----BEGIN CERTIFICATE-----\nMIIBCg==\n"));

        let cert = std::fs::read(connection.client_certificate.unwrap()).unwrap();
        assert_eq!(cert, b"CERT PEM");
    }

    #[cfg(unix)]
    fn fake_kubectl(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_pipes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls");
        let binary = fake_kubectl(
            dir.path(),
            &format!("echo \"$@\" >> {0}\ncat >> {0}", log.display()),
        );
        let applier = KubectlApplier::new(ClusterConnection {
            server: Some("https://cluster".into()),
            token: Some("s3cr3t".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        })
        .unwrap()
        .with_binary(binary);

        applier.apply("shop", "kind: ConfigMap").await.unwrap();
        applier.remove("shop", "kind: Secret").await.unwrap();

        let kubeconfig = applier.kubeconfig().display().to_string();
        let calls = std::fs::read_to_string(log).unwrap();
        assert_eq!(
            calls,
            format!(
                "apply -f - --namespace shop --kubeconfig={0}\nkind: ConfigMap\
                 delete -f - --namespace shop --kubeconfig={0} --ignore-not-found=true\nkind: Secret",
                kubeconfig
            )
        );
        assert!(!calls.contains("s3cr3t"));
        assert!(!calls.contains("hunter2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stalled_tool_times_out_while_fed() {
        let dir = tempfile::tempdir().unwrap();
        // Never reads stdin, so a large manifest fills the pipe.
        let binary = fake_kubectl(dir.path(), "exec sleep 30");
        let applier = KubectlApplier::new(ClusterConnection::default())
            .unwrap()
            .with_binary(binary)
            .with_timeout(Duration::from_secs(1));
        let manifest = "x".repeat(4 * 1024 * 1024);

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            applier.apply("shop", &manifest),
        )
        .await
        .expect("timeout did not cover the stdin write");

        assert!(matches!(
            result,
            Err(DeploymentError::ToolTimeout { timeout_secs: 1, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_reports_stderr_not_broken_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_kubectl(dir.path(), "echo 'error: forbidden' >&2\nexit 1");
        let applier = KubectlApplier::new(ClusterConnection::default())
            .unwrap()
            .with_binary(binary);
        let manifest = "x".repeat(1024 * 1024);

        match applier.apply("shop", &manifest).await.unwrap_err() {
            DeploymentError::Tool { stderr, .. } => assert_eq!(stderr, "error: forbidden"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_kubectl(
            dir.path(),
            "cat > /dev/null\necho 'error: unable to recognize \"STDIN\"' >&2\nexit 1",
        );
        let applier = KubectlApplier::new(ClusterConnection::default())
            .unwrap()
            .with_binary(binary);

        let err = applier.apply("shop", "kind: Nope").await.unwrap_err();
        match err {
            DeploymentError::Tool { exit, stderr, .. } => {
                assert!(exit.contains('1'));
                assert_eq!(stderr, "error: unable to recognize \"STDIN\"");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}

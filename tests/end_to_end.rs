//! Whole-installation scenarios against temporary directories

use std::fs;
use std::path::PathBuf;

use ssh_key::{Certificate, PrivateKey, PublicKey};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use devbox_ssh::ca::{CaState, CertificateAuthority};
use devbox_ssh::config::Paths;
use devbox_ssh::error::DevboxError;
use devbox_ssh::provision::{ContainerEndpoint, DirectoryInstaller, Provisioner};
use devbox_ssh::ssh::{config_file, known_hosts, render_block, TrustMode, TrustStore};

struct Installation {
    _dir: TempDir,
    paths: Paths,
}

impl Installation {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let paths = Paths::from_root(dir.path().join("devbox"), dir.path().join("ssh").join("config"));
        Self { _dir: dir, paths }
    }

    fn ca(&self) -> CertificateAuthority {
        CertificateAuthority::new(&self.paths.ca_dir)
    }

    fn provisioner(&self) -> Provisioner<DirectoryInstaller> {
        Provisioner::new(
            self.ca(),
            TrustStore::new(&self.paths.known_hosts),
            &self.paths.ssh_config,
            DirectoryInstaller::new(&self.paths.hosts_dir),
        )
        .with_control_dir(&self.paths.control_dir)
    }

    /// Write a throwaway host keypair the way `ssh-keygen` would
    fn host_key(&self, name: &str) -> PathBuf {
        let key = PrivateKey::random(&mut rand_core::OsRng, ssh_key::Algorithm::Ed25519).unwrap();
        let dir = self.paths.root.join("scratch");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, key.to_openssh(ssh_key::LineEnding::LF).unwrap().as_bytes()).unwrap();
        fs::write(
            dir.join(format!("{}.pub", name)),
            format!("{}\n", key.public_key().to_openssh().unwrap()),
        )
        .unwrap();
        path
    }
}

#[test]
fn generate_sign_trust_render() {
    let inst = Installation::new();
    let ca = inst.ca();

    assert!(!ca.exists());
    let ca_line = ca.generate().unwrap();
    assert!(ca.exists());

    let host_key = inst.host_key("ssh_host_ed25519_key");
    let cert_path = ca
        .sign_host_key(&host_key, "dev-sample", "10.0.0.5:2201")
        .unwrap();
    assert_eq!(
        cert_path.file_name().unwrap(),
        "ssh_host_ed25519_key-cert.pub"
    );
    let cert_text = fs::read_to_string(&cert_path).unwrap();
    assert!(cert_text.starts_with("ssh-ed25519-cert-v01@openssh.com "));

    let cert = Certificate::from_openssh(cert_text.trim()).unwrap();
    assert_eq!(cert.valid_principals(), ["dev-sample", "10.0.0.5"]);
    let ca_key = PublicKey::from_openssh(&ca_line).unwrap();
    assert_eq!(cert.signature_key(), ca_key.key_data());

    assert!(known_hosts::write_entry(&inst.paths.known_hosts, "10.0.0.5:2201", &ca_line).unwrap());
    let trust = fs::read_to_string(&inst.paths.known_hosts).unwrap();
    assert!(trust.starts_with("@cert-authority "));
    assert!(trust.contains("[10.0.0.5]:*"));
    assert!(trust.contains(&ca_line));

    let block = render_block(
        "dev-sample",
        "10.0.0.5",
        2201,
        "dev",
        TrustMode::CertAuthority(inst.paths.known_hosts.clone()),
    )
    .unwrap();
    assert!(block.contains("StrictHostKeyChecking yes"));
    assert!(block.contains(&inst.paths.known_hosts.display().to_string()));
}

#[test]
fn trust_entries_are_idempotent_per_host() {
    let inst = Installation::new();
    let ca_line = inst.ca().generate().unwrap();
    let path = &inst.paths.known_hosts;

    assert!(known_hosts::write_entry(path, "10.0.0.5:2201", &ca_line).unwrap());
    assert!(!known_hosts::write_entry(path, "10.0.0.5:2201", &ca_line).unwrap());
    assert!(known_hosts::write_entry(path, "build.example.com", &ca_line).unwrap());

    let text = fs::read_to_string(path).unwrap();
    assert_eq!(text.lines().count(), 2);
    assert_eq!(text.matches("[10.0.0.5]:*").count(), 1);
    assert_eq!(text.matches("build.example.com ").count(), 1);
}

#[test]
fn second_init_keeps_existing_keys() {
    let inst = Installation::new();
    let ca = inst.ca();
    ca.generate().unwrap();

    let private_before = fs::read(ca.private_key_path()).unwrap();
    let public_before = fs::read(ca.public_key_path()).unwrap();

    assert!(matches!(ca.generate(), Err(DevboxError::CaAlreadyExists(_))));
    assert_eq!(fs::read(ca.private_key_path()).unwrap(), private_before);
    assert_eq!(fs::read(ca.public_key_path()).unwrap(), public_before);
}

#[test]
fn partial_ca_is_not_ready() {
    let inst = Installation::new();
    let ca = inst.ca();
    ca.generate().unwrap();
    fs::remove_file(ca.public_key_path()).unwrap();

    assert!(!ca.exists());
    assert!(matches!(ca.state(), CaState::Partial { .. }));

    let host_key = inst.host_key("key");
    let err = ca.sign_host_key(&host_key, "dev-a", "10.0.0.5").unwrap_err();
    assert!(err.needs_init());
    assert!(!host_key.with_file_name("key-cert.pub").exists());
}

#[test]
fn signing_without_ca_writes_nothing() {
    let inst = Installation::new();
    let host_key = inst.host_key("key");

    let err = inst
        .ca()
        .sign_host_key(&host_key, "dev-a", "10.0.0.5")
        .unwrap_err();
    assert!(matches!(err, DevboxError::CaNotFound(_)));
    assert!(err.hint().unwrap().contains("devbox-ssh init"));
    assert!(!host_key.with_file_name("key-cert.pub").exists());
}

#[test]
fn upsert_leaves_unrelated_blocks_byte_identical() {
    let inst = Installation::new();
    let path = &inst.paths.ssh_config;
    fs::create_dir_all(path.parent().unwrap()).unwrap();

    let work = "# work bastion\nHost bastion\n  HostName bastion.corp.example\n  User ops\n";
    let github = "Host github.com\n  User git\n  IdentityFile ~/.ssh/id_github\n";
    let pi = "Host pi\n  HostName 192.168.1.20\n";
    let original = format!(
        "{work}\nHost dev-foo\n  HostName 10.0.0.9\n  Port 2200\n\n{github}\n{pi}"
    );
    fs::write(path, &original).unwrap();

    let block = render_block("dev-foo", "10.0.0.5", 2201, "dev", TrustMode::Disabled).unwrap();
    assert!(config_file::upsert(path, "dev-foo", &block).unwrap());

    let updated = fs::read_to_string(path).unwrap();
    assert!(updated.contains(work));
    assert!(updated.contains(github));
    assert!(updated.contains(pi));
    assert!(updated.contains(&block));
    assert!(!updated.contains("10.0.0.9"));
    assert_eq!(updated.matches("Host dev-foo").count(), 1);

    assert!(!config_file::upsert(path, "dev-foo", &block).unwrap());
}

#[tokio::test]
async fn provision_then_deprovision() {
    let inst = Installation::new();
    inst.ca().generate().unwrap();
    let provisioner = inst.provisioner();

    let endpoint = ContainerEndpoint::new("dev-sample", "10.0.0.5", "dev", 2201);
    let outcome = provisioner
        .provision(&endpoint, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.principals, ["dev-sample", "10.0.0.5"]);

    let staged = inst.paths.hosts_dir.join("dev-sample");
    assert!(staged.join("ssh_host_ed25519_key").exists());
    assert!(staged.join("ssh_host_ed25519_key-cert.pub").exists());

    let config = fs::read_to_string(&inst.paths.ssh_config).unwrap();
    assert!(config.contains("Host dev-sample\n"));
    assert!(config.contains("StrictHostKeyChecking yes"));
    assert!(inst.paths.control_dir.is_dir());

    assert!(provisioner.deprovision("dev-sample").await.unwrap());
    assert!(!staged.exists());
    let config = fs::read_to_string(&inst.paths.ssh_config).unwrap();
    assert!(!config.contains("dev-sample"));
}

#[tokio::test]
async fn provision_without_ca_touches_nothing() {
    let inst = Installation::new();
    let endpoint = ContainerEndpoint::new("dev-sample", "10.0.0.5", "dev", 2201);

    let err = inst
        .provisioner()
        .provision(&endpoint, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DevboxError::CaNotFound(_)));
    assert!(!inst.paths.hosts_dir.exists());
    assert!(!inst.paths.ssh_config.exists());
    assert!(!inst.paths.known_hosts.exists());
}

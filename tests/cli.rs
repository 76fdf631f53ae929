use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

const CONFIG: &str = r#"{
    "transport": {
        "quiescence_interval_ms": 20,
        "response_timeout_ms": 5000,
        "chunk_delay_ms": 0
    }
}"#;

fn bin() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("cardvault"))
}

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), CONFIG).unwrap();
        Self { dir }
    }

    fn vault(&self) -> PathBuf {
        self.dir.path().join("vault.kdbx")
    }

    fn card(&self) -> PathBuf {
        self.dir.path().join("card")
    }

    fn base(&self, password: &str) -> Command {
        let mut cmd = bin();
        cmd.env_remove("CARDVAULT_FILE")
            .env_remove("CARDVAULT_CARD")
            .env_remove("CARDVAULT_CONFIG")
            .env("CARDVAULT_PASSWORD", password)
            .arg("--config")
            .arg(self.dir.path().join("config.json"));
        cmd
    }

    /// Command against the local vault file.
    fn file(&self, password: &str) -> Command {
        let mut cmd = self.base(password);
        cmd.arg("--file").arg(self.vault());
        cmd
    }

    /// Command against the emulated card.
    fn on_card(&self, password: &str) -> Command {
        let mut cmd = self.base(password);
        cmd.arg("--card").arg(self.card());
        cmd
    }
}

fn init(cmd: &mut Command) {
    cmd.arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("vault initialized"));
}

fn starts_with_kdbx_magic(path: &Path) -> bool {
    let data = std::fs::read(path).unwrap();
    data.starts_with(&[0x03, 0xD9, 0xA2, 0x9A, 0x67, 0xFB, 0x4B, 0xB5])
}

#[test]
fn init_creates_vault_file() {
    let env = Env::new();
    init(&mut env.file("pw"));

    assert!(env.vault().exists());
    assert!(starts_with_kdbx_magic(&env.vault()));
}

#[test]
fn init_twice_fails() {
    let env = Env::new();
    init(&mut env.file("pw"));

    env.file("pw")
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn init_rejects_rounds_below_policy() {
    let env = Env::new();
    env.file("pw")
        .args(["init", "--rounds", "6000"])
        .assert()
        .failure();
    assert!(!env.vault().exists());
}

#[test]
fn add_show_roundtrip() {
    let env = Env::new();
    init(&mut env.file("pw"));

    env.file("pw")
        .args(["add", "github", "-u", "alice", "-p", "hunter2"])
        .arg("--url")
        .arg("https://github.com")
        .assert()
        .success()
        .stdout(predicate::str::contains("added entry 'github'"));

    env.file("pw")
        .args(["show", "github"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice"))
        .stdout(predicate::str::contains("********"))
        .stdout(predicate::str::contains("hunter2").not());

    env.file("pw")
        .args(["show", "GitHub", "--reveal"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hunter2"));
}

#[test]
fn password_is_not_stored_in_plaintext() {
    let env = Env::new();
    init(&mut env.file("pw"));
    env.file("pw")
        .args(["add", "bank", "-p", "very-secret-pin"])
        .assert()
        .success();

    let data = std::fs::read(env.vault()).unwrap();
    let needle = b"very-secret-pin";
    assert!(!data.windows(needle.len()).any(|w| w == needle));
}

#[test]
fn wrong_password_fails() {
    let env = Env::new();
    init(&mut env.file("right"));

    env.file("wrong")
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid password"));
}

#[test]
fn groups_and_listing() {
    let env = Env::new();
    init(&mut env.file("pw"));

    env.file("pw")
        .args(["mkgroup", "Email"])
        .assert()
        .success();
    env.file("pw")
        .args(["add", "gmail", "-u", "bob", "-g", "email"])
        .assert()
        .success();
    env.file("pw").args(["add", "github"]).assert().success();

    env.file("pw")
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Passwords/"))
        .stdout(predicate::str::contains("  Email/"))
        .stdout(predicate::str::contains("gmail  (bob)"));

    env.file("pw")
        .args(["rmgroup", "Email"])
        .assert()
        .success();
    env.file("pw")
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("gmail").not());
}

#[test]
fn edit_keeps_history() {
    let env = Env::new();
    init(&mut env.file("pw"));
    env.file("pw")
        .args(["add", "github", "-p", "old"])
        .assert()
        .success();

    env.file("pw")
        .args(["edit", "github", "-p", "new", "--title", "GitHub"])
        .assert()
        .success()
        .stdout(predicate::str::contains("updated"));

    env.file("pw")
        .args(["show", "GitHub", "--reveal"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Password:  new"))
        .stdout(predicate::str::contains("History:   1 version(s)"));
}

#[test]
fn remove_missing_entry_fails() {
    let env = Env::new();
    init(&mut env.file("pw"));

    env.file("pw")
        .args(["remove", "nothing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn remove_entry() {
    let env = Env::new();
    init(&mut env.file("pw"));
    env.file("pw").args(["add", "github"]).assert().success();

    env.file("pw")
        .args(["remove", "github"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed"));

    env.file("pw")
        .args(["show", "github"])
        .assert()
        .failure();
}

#[test]
fn search_by_field() {
    let env = Env::new();
    init(&mut env.file("pw"));
    env.file("pw")
        .args(["add", "github", "-u", "alice"])
        .assert()
        .success();
    env.file("pw")
        .args(["add", "alice's bank"])
        .assert()
        .success();

    env.file("pw")
        .args(["search", "ALICE", "--field", "username"])
        .assert()
        .success()
        .stdout(predicate::str::contains("github"))
        .stdout(predicate::str::contains("alice's bank").not());

    env.file("pw")
        .args(["search", "zzz"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no matches"));
}

#[test]
fn info_reports_format() {
    let env = Env::new();
    init(&mut env.file("pw"));

    env.file("pw")
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("KDBX 3.1"))
        .stdout(predicate::str::contains("Rounds:       80000"))
        .stdout(predicate::str::contains("Compression:  gzip"));
}

#[test]
fn passwd_changes_password() {
    let env = Env::new();
    init(&mut env.file("old"));

    env.file("old")
        .arg("passwd")
        .write_stdin("new\nnew\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("password changed"));

    env.file("old").arg("list").assert().failure();
    env.file("new").arg("list").assert().success();
}

#[test]
fn passwd_mismatch_fails() {
    let env = Env::new();
    init(&mut env.file("pw"));

    env.file("pw")
        .arg("passwd")
        .write_stdin("one\ntwo\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("passwords do not match"));
}

#[test]
fn card_init_add_list() {
    let env = Env::new();
    init(&mut env.on_card("pw"));
    assert!(starts_with_kdbx_magic(
        &env.card().join("passwordvault").join("db.kdbx")
    ));

    env.on_card("pw")
        .args(["add", "door", "-p", "1234"])
        .assert()
        .success();

    env.on_card("pw")
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("door"));

    env.on_card("pw")
        .args(["show", "door", "--reveal"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1234"));
}

#[test]
fn card_without_vault_reports_missing_database() {
    let env = Env::new();
    env.on_card("pw")
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no database found on card"));
}

#[test]
fn card_init_twice_fails() {
    let env = Env::new();
    init(&mut env.on_card("pw"));

    env.on_card("other")
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn invalid_config_is_rejected() {
    let env = Env::new();
    std::fs::write(
        env.dir.path().join("config.json"),
        r#"{ "transport": { "chunk_size": 500 } }"#,
    )
    .unwrap();

    env.file("pw")
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("chunk_size"));
}

#[test]
fn generate_respects_length_and_classes() {
    let output = bin()
        .env_remove("CARDVAULT_CONFIG")
        .args(["generate", "--length", "50", "--digits"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let password = String::from_utf8(output).unwrap();
    let password = password.trim_end_matches('\n');

    assert_eq!(password.len(), 50);
    assert!(password.chars().all(|c| c.is_ascii_digit()));
}

#[test]
fn generate_rejects_out_of_range_length() {
    for length in ["9", "201"] {
        bin()
            .env_remove("CARDVAULT_CONFIG")
            .args(["generate", "--length", length])
            .assert()
            .failure()
            .stderr(predicate::str::contains("outside 10..=200"));
    }
}

#[test]
fn add_with_generated_password() {
    let env = Env::new();
    init(&mut env.file("pw"));

    env.file("pw")
        .args(["add", "router", "--generate"])
        .assert()
        .success();

    let output = env
        .file("pw")
        .args(["show", "router", "--reveal"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    let password = text
        .lines()
        .find_map(|l| l.strip_prefix("Password:  "))
        .unwrap();
    assert_eq!(password.len(), 32);
    assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
}

#[test]
fn settings_change_rounds_and_compression() {
    let env = Env::new();
    init(&mut env.file("pw"));
    env.file("pw").args(["add", "github"]).assert().success();

    env.file("pw")
        .args(["settings", "--rounds", "100000", "--no-gzip"])
        .assert()
        .success()
        .stdout(predicate::str::contains("settings updated"));

    env.file("pw")
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Rounds:       100000"))
        .stdout(predicate::str::contains("Compression:  none"))
        .stdout(predicate::str::contains("Entries:      1"));
}

#[test]
fn settings_reject_low_rounds_and_empty_changes() {
    let env = Env::new();
    init(&mut env.file("pw"));

    env.file("pw")
        .args(["settings", "--rounds", "8000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("below the minimum"));

    env.file("pw")
        .arg("settings")
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing to change"));

    env.file("pw")
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Rounds:       80000"));
}

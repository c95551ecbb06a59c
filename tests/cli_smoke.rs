use std::{fmt::Write as _, fs, path::PathBuf};

use anyhow::{Context, Result};
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

struct HelpCase {
    path: &'static [&'static str],
    expected_snippet: &'static str,
}

const HELP_CASES: &[HelpCase] = &[
    HelpCase {
        path: &[],
        expected_snippet: "Leaderboard snapshot rebuild CLI",
    },
    HelpCase {
        path: &["rebuild"],
        expected_snippet: "Rebuild the high score snapshot from the score update log",
    },
    HelpCase {
        path: &["publish"],
        expected_snippet: "Append score updates to the score update log",
    },
    HelpCase {
        path: &["snapshot"],
        expected_snippet: "Show the current snapshot table",
    },
    HelpCase {
        path: &["config"],
        expected_snippet: "Print or save the effective configuration",
    },
];

struct CliTest {
    tmp: TempDir,
    config_path: PathBuf,
}

impl CliTest {
    fn new() -> Result<Self> {
        let tmp = TempDir::new().context("failed to create temp dir")?;
        let log_dir = tmp.path().join("log");
        fs::create_dir_all(&log_dir)?;
        let config_path = tmp.path().join("scoresnap.toml");
        let config = format!(
            "source_bootstrap_address = \"file://{}\"\n\
             sink_connection_uri = \"sqlite://{}\"\n\
             poll_timeout_ms = 20\n",
            log_dir.display(),
            tmp.path().join("leaderboard.db").display()
        );
        fs::write(&config_path, config)?;
        Ok(Self { tmp, config_path })
    }

    fn command(&self, args: &[&str]) -> Result<Command> {
        let mut cmd = Command::cargo_bin("scoresnap")?;
        cmd.arg("--config").arg(&self.config_path);
        cmd.args(args);
        cmd.env("RUST_LOG", "warn");
        Ok(cmd)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.command(args)?.output()?;
        if !output.status.success() {
            anyhow::bail!(
                "scoresnap {:?} exited with {}: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8(output.stdout)?)
    }
}

#[test]
fn cli_help_regressions() -> Result<()> {
    for case in HELP_CASES {
        let mut cmd = Command::cargo_bin("scoresnap")?;
        let output = cmd.args(case.path).arg("--help").output()?;
        assert!(output.status.success(), "help for {:?} failed", case.path);
        let stdout = String::from_utf8(output.stdout)?.replace("\r\n", "\n");
        assert!(
            stdout.contains(case.expected_snippet),
            "expected help for {:?} to contain {:?}\nstdout:\n{}",
            case.path,
            case.expected_snippet,
            indent_output(&stdout)
        );
    }
    Ok(())
}

#[test]
fn publish_rebuild_and_query_snapshot() -> Result<()> {
    let cli = CliTest::new()?;
    cli.run(&["publish", "alice", "100"])?;
    cli.run(&["publish", "bob", "50"])?;
    cli.run(&["publish", "alice", "80"])?;

    let stdout = cli.run(&["rebuild"])?;
    assert!(stdout.contains("Starting snapshot rebuild ..."), "{stdout}");
    assert!(stdout.contains("Snapshot rebuild finished."), "{stdout}");

    let json = cli.run(&["snapshot", "--json"])?;
    let rows: Value = serde_json::from_str(&json)?;
    assert_eq!(rows[0]["player_id"], "alice");
    assert_eq!(rows[0]["score"], 100);
    assert_eq!(rows[1]["player_id"], "bob");
    assert_eq!(rows[1]["score"], 50);
    assert_eq!(rows.as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn publish_from_stdin_skips_malformed_lines() -> Result<()> {
    let cli = CliTest::new()?;
    let output = cli
        .command(&["publish", "--stdin"])?
        .write_stdin(
            "{\"lb\":\"global\",\"player\":\"p1\",\"score\":123}\nnot json\n\
             {\"lb\":\"global\",\"player\":\"p2\",\"score\":-4}\n",
        )
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("Published p1:123"), "{stdout}");
    assert!(stdout.contains("Published p2:-4"), "{stdout}");
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("Malformed input: not json"), "{stderr}");
    Ok(())
}

#[test]
fn rebuild_reports_skipped_records() -> Result<()> {
    let cli = CliTest::new()?;
    let partition = cli
        .tmp
        .path()
        .join("log")
        .join("score_updates")
        .join("partition-0.jsonl");
    fs::create_dir_all(partition.parent().context("partition has a parent")?)?;
    fs::write(
        &partition,
        "{\"key\":\"carol\",\"value\":\"not-a-number\"}\n{\"key\":\"dave\",\"value\":\"7\"}\n",
    )?;

    let stdout = cli.run(&["rebuild"])?;
    assert!(stdout.contains("Skipped 1 malformed record(s)"), "{stdout}");
    assert!(stdout.contains("key carol"), "{stdout}");
    Ok(())
}

#[test]
fn missing_log_directory_exits_with_connection_status() -> Result<()> {
    let cli = CliTest::new()?;
    let missing = format!("file://{}", cli.tmp.path().join("absent").display());
    let output = cli.command(&["rebuild", "--source", &missing])?.output()?;
    assert_eq!(output.status.code(), Some(3));
    let stdout = String::from_utf8(output.stdout)?;
    assert!(!stdout.contains("Snapshot rebuild finished."));
    Ok(())
}

#[test]
fn invalid_configuration_exits_with_config_status() -> Result<()> {
    let cli = CliTest::new()?;
    let output = cli
        .command(&["rebuild", "--sink", "mysql://localhost/leaderboard"])?
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    Ok(())
}

#[test]
fn malformed_config_file_exits_with_config_status() -> Result<()> {
    let cli = CliTest::new()?;
    fs::write(&cli.config_path, "topic = [\n")?;
    let output = cli.command(&["rebuild"])?.output()?;
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("scoresnap.toml"), "{stderr}");
    Ok(())
}

#[test]
fn config_command_prints_effective_settings() -> Result<()> {
    let cli = CliTest::new()?;
    let stdout = cli.run(&["config", "--group", "nightly", "--commit-attempts", "3"])?;
    assert!(stdout.contains("consumer_group_id = \"nightly\""), "{stdout}");
    assert!(stdout.contains("commit_attempts = 3"), "{stdout}");
    Ok(())
}

fn indent_output(output: &str) -> String {
    let mut indented = String::new();
    for line in output.lines() {
        let _ = writeln!(&mut indented, "    {}", line);
    }
    indented
}

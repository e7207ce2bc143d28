//! Integration tests for the RiptideKV CLI. Each test spawns the built
//! binary against a fresh data directory, feeds it commands over stdin,
//! and checks the transcript on stdout.
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn run_cli_command(data_dir: &Path, command: &str) -> String {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new("cargo")
        .args(["run", "-p", "cli", "--"])
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--shard-count")
        .arg("2")
        .arg("--memtable-kb")
        .arg("1")
        .arg("--l0-trigger")
        .arg("2")
        .env("RIPTIDE_WAL_SYNC", "true")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn CLI");

    {
        let stdin = child.stdin.as_mut().expect("Failed to open stdin");
        stdin
            .write_all(command.as_bytes())
            .expect("Failed to write to stdin");
        stdin.write_all(b"EXIT\n").expect("Failed to write EXIT");
    }

    let output = child.wait_with_output().expect("Failed to read output");
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_basic_set_get() {
    let dir = tempdir().unwrap();
    let output = run_cli_command(dir.path(), "SET key1 value1\nGET key1\n");

    assert!(output.contains("OK"));
    assert!(output.contains("value1"));
}

#[test]
fn test_multiple_keys() {
    let dir = tempdir().unwrap();
    let commands = "SET a 1\nSET b 2\nSET c 3\nGET a\nGET b\nGET c\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("1"));
    assert!(output.contains("2"));
    assert!(output.contains("3"));
}

#[test]
fn test_overwrite_key() {
    let dir = tempdir().unwrap();
    let commands = "SET mykey oldvalue\nGET mykey\nSET mykey newvalue\nGET mykey\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("oldvalue"));
    assert!(output.contains("newvalue"));
}

#[test]
fn test_delete_key() {
    let dir = tempdir().unwrap();
    let commands = "SET delme value\nGET delme\nDEL delme\nGET delme\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("value"));
    assert!(output.contains("(nil)"));
}

#[test]
fn test_range_scan() {
    let dir = tempdir().unwrap();

    let mut commands = String::new();
    for i in 0..10 {
        commands.push_str(&format!("SET key{:02} value{}\n", i, i));
    }
    commands.push_str("SCAN\n");
    commands.push_str("SCAN key03 key07\n");

    let output = run_cli_command(dir.path(), &commands);

    assert!(output.contains("key00"));
    assert!(output.contains("key09"));
}

#[test]
fn test_flush_to_sstable() {
    let dir = tempdir().unwrap();
    let commands = "SET a 1\nSET b 2\nFLUSH\nGET a\nGET b\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("OK"));
    assert!(output.contains("1"));
    assert!(output.contains("2"));

    let has_sst = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.path().is_dir() && e.file_name().to_string_lossy().starts_with("shard_"));
    assert!(has_sst, "at least one shard directory should exist after flush");
}

#[test]
fn test_auto_flush_on_threshold() {
    let dir = tempdir().unwrap();

    let mut commands = String::new();
    for i in 0..50 {
        commands.push_str(&format!("SET key{:03} value_with_some_data_{}\n", i, i));
    }
    commands.push_str("SCAN\n");

    let output = run_cli_command(dir.path(), &commands);

    assert!(output.contains("key000"));
    assert!(output.contains("key049"));
}

#[test]
fn test_compaction() {
    let dir = tempdir().unwrap();

    let mut commands = String::new();
    for batch in 0..3 {
        for i in 0..5 {
            commands.push_str(&format!(
                "SET batch{}_key{} val{}\n",
                batch,
                i,
                batch * 10 + i
            ));
        }
        commands.push_str("FLUSH\n");
    }

    commands.push_str("COMPACT\n");

    for batch in 0..3 {
        for i in 0..5 {
            commands.push_str(&format!("GET batch{}_key{}\n", batch, i));
        }
    }

    let output = run_cli_command(dir.path(), &commands);

    assert!(output.contains("val0"));
    assert!(output.contains("val10"));
}

#[test]
fn test_tombstone_in_range_scan() {
    let dir = tempdir().unwrap();
    let commands = "SET a 1\nSET b 2\nSET c 3\nSET d 4\nDEL b\nFLUSH\nSCAN\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("a"));
    assert!(output.contains("c"));
    assert!(output.contains("d"));

    let lines: Vec<&str> = output.lines().collect();
    let scan_section = lines
        .iter()
        .skip_while(|l| !l.contains("SCAN"))
        .take_while(|l| !l.contains("entries"))
        .collect::<Vec<_>>();

    let entry_count = scan_section.iter().filter(|l| l.contains("->")).count();
    assert_eq!(
        entry_count, 3,
        "Should have 3 entries (a, c, d), b should be deleted"
    );
}

#[test]
fn test_binary_data() {
    let dir = tempdir().unwrap();
    let commands =
        "SET KEY1 VALUE1\nSET Key2 Value2\nSET key3 value3\nGET KEY1\nGET Key2\nGET key3\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("VALUE1"));
    assert!(output.contains("Value2"));
    assert!(output.contains("value3"));
}

#[test]
fn test_empty_key_rejection() {
    let dir = tempdir().unwrap();
    let commands = "SET normalkey value\nGET normalkey\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("value"));
}

#[test]
fn test_stats_output() {
    let dir = tempdir().unwrap();
    let commands = "SET x 1\nSET y 2\nFLUSH\nSTATS\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("shards=") || output.contains("memtable_entries"));
}

#[test]
fn test_quit_command() {
    let dir = tempdir().unwrap();
    let commands = "SET foo bar\nQUIT\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("OK"));
    assert!(output.contains("bye"));
}

#[test]
fn test_persistence_across_restarts() {
    let dir = tempdir().unwrap();

    let commands1 = "SET persist_key persist_value\nFLUSH\n";
    run_cli_command(dir.path(), commands1);

    let commands2 = "GET persist_key\n";
    let output2 = run_cli_command(dir.path(), commands2);

    assert!(output2.contains("persist_value"));
}

#[test]
fn test_large_value() {
    let dir = tempdir().unwrap();

    let large_value = "x".repeat(500);
    let commands = format!("SET large_key {}\nGET large_key\n", large_value);
    let output = run_cli_command(dir.path(), &commands);

    assert!(output.contains('x'));
}

#[test]
fn test_sequential_get_after_multiple_operations() {
    let dir = tempdir().unwrap();

    let mut commands = String::new();
    for i in 0..20 {
        commands.push_str(&format!("SET seq_key{:02} value{}\n", i, i));
    }
    for _ in 0..3 {
        commands.push_str("FLUSH\n");
    }
    for i in (0..20).step_by(2) {
        commands.push_str(&format!("SET seq_key{:02} updated{}\n", i, i));
    }
    for i in 0..20 {
        commands.push_str(&format!("GET seq_key{:02}\n", i));
    }

    let output = run_cli_command(dir.path(), &commands);

    assert!(output.contains("updated0"));
    assert!(output.contains("value1"));
}

#[test]
fn test_mixed_operations_stress() {
    let dir = tempdir().unwrap();

    let mut commands = String::new();
    for i in 0..30 {
        match i % 4 {
            0 => commands.push_str(&format!("SET stress_k{} stress_v{}\n", i, i)),
            1 => commands.push_str(&format!("GET stress_k{}\n", i)),
            2 => commands.push_str(&format!("DEL stress_k{}\n", (i - 2).max(0))),
            _ => commands.push_str("FLUSH\n"),
        }
    }
    commands.push_str("SCAN\n");

    let output = run_cli_command(dir.path(), &commands);

    assert!(!output.is_empty());
}

#[test]
fn test_batch_put_and_history() {
    let dir = tempdir().unwrap();
    let commands = "batch put k1 v1 k2 v2 k3 v3\nSET k1 v1updated\nhistory k1\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("OK 3 keys"));
    assert!(output.contains("v1"));
    assert!(output.contains("v1updated"));
}

#[test]
fn test_show_keys_and_config() {
    let dir = tempdir().unwrap();
    let commands = "SET a 1\nSET b 2\nshow keys\nshow config\nshow connection\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("a"));
    assert!(output.contains("b"));
    assert!(output.contains("shard_count="));
    assert!(output.contains("connected=true"));
}

#[test]
fn test_select_prefix() {
    let dir = tempdir().unwrap();
    let commands = "SET user:1 alice\nSET user:2 bob\nSET order:1 widget\nselect * from user:\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("alice"));
    assert!(output.contains("bob"));
    assert!(!output.contains("widget"));
}

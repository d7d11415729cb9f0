//! Unit tests for file operations

use super::*;
use crate::test_utils::{Call, MockHost};

const PATH: &str = "/tmp/x";

#[test]
fn test_strategy_selection() {
    use FileOperation::*;

    assert_eq!(select_strategy(Write, false), Strategy::BulkCopy);
    assert_eq!(select_strategy(Read, false), Strategy::NativeTransfer);
    assert_eq!(select_strategy(Delete, false), Strategy::NativeTransfer);

    for operation in [Write, Read, Delete] {
        assert_eq!(select_strategy(operation, true), Strategy::ShellCommand);
    }
    for operation in [Chmod, Chown, Chgrp, Exists, Stat] {
        assert_eq!(select_strategy(operation, false), Strategy::ShellCommand);
        assert_eq!(select_strategy(operation, true), Strategy::ShellCommand);
    }
}

#[test]
fn test_canonical_permissions() {
    assert_eq!(canonical_permissions("644\n"), "0644");
    assert_eq!(canonical_permissions("1755\n"), "1755");
    assert_eq!(canonical_permissions("7"), "07");
    assert_eq!(canonical_permissions(""), "");
}

#[test]
fn test_shell_quote() {
    assert_eq!(shell_quote("/tmp/x"), "'/tmp/x'");
    assert_eq!(shell_quote("/tmp/it's"), r"'/tmp/it'\''s'");
    assert_eq!(shell_quote("/tmp/$(reboot)"), "'/tmp/$(reboot)'");
}

#[test]
fn test_parse_mode() {
    assert_eq!(parse_mode("0644").unwrap(), 0o644);
    assert_eq!(parse_mode("1755").unwrap(), 0o1755);
    assert!(matches!(parse_mode("0968"), Err(RemoteError::Configuration(_))));
    assert!(matches!(parse_mode(""), Err(RemoteError::Configuration(_))));
    assert!(matches!(parse_mode("07777"), Err(RemoteError::Configuration(_))));
}

#[tokio::test]
async fn test_write_read_round_trip_plain() {
    let host = MockHost::new();
    let ops = FileOps::new(&host, false);

    ops.write(PATH, "hello", "0644").await.unwrap();
    assert_eq!(ops.read(PATH).await.unwrap(), "hello");

    assert_eq!(
        host.calls(),
        vec![Call::ScpWrite(PATH.to_string()), Call::SftpRead(PATH.to_string())]
    );
    assert_eq!(host.file(PATH).unwrap().mode, 0o644);
}

#[tokio::test]
async fn test_write_read_round_trip_sudo() {
    let host = MockHost::new();
    let ops = FileOps::new(&host, true);

    ops.write(PATH, "hello", "0644").await.unwrap();
    assert_eq!(ops.read(PATH).await.unwrap(), "hello");

    assert_eq!(
        host.calls(),
        vec![
            Call::Command("cat /dev/stdin | sudo tee '/tmp/x' > /dev/null".to_string()),
            Call::Command("sudo cat '/tmp/x'".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_plain_write_rejects_bad_permissions() {
    let host = MockHost::new();
    let ops = FileOps::new(&host, false);

    let err = ops.write(PATH, "hello", "abc").await.unwrap_err();
    assert!(matches!(err, RemoteError::Configuration(_)));
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_read_missing_is_not_found() {
    for sudo in [false, true] {
        let host = MockHost::new();
        let err = FileOps::new(&host, sudo).read(PATH).await.unwrap_err();
        assert!(err.is_not_found(), "sudo={}: {}", sudo, err);
    }
}

#[tokio::test]
async fn test_sudo_read_denied_keeps_command_error() {
    let host = MockHost::new();
    host.put_file(PATH, "secret", 0o600);
    host.deny(PATH);

    let err = FileOps::new(&host, true).read(PATH).await.unwrap_err();
    let command = err.as_command().expect("command error");
    assert_eq!(command.command, "sudo cat '/tmp/x'");
    assert_eq!(command.exit_status(), Some(1));
    assert!(command.stderr.contains("Permission denied"));
}

#[tokio::test]
async fn test_delete_routes_by_sudo() {
    let host = MockHost::new();
    host.put_file(PATH, "a", 0o644);
    FileOps::new(&host, false).delete(PATH).await.unwrap();
    assert_eq!(host.calls(), vec![Call::SftpRemove(PATH.to_string())]);
    assert!(host.file(PATH).is_none());

    let host = MockHost::new();
    host.put_file(PATH, "a", 0o644);
    FileOps::new(&host, true).delete(PATH).await.unwrap();
    assert_eq!(host.calls(), vec![Call::Command("sudo rm '/tmp/x'".to_string())]);

    let err = FileOps::new(&host, true).delete(PATH).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_ownership_changes_always_use_shell() {
    for sudo in [false, true] {
        let host = MockHost::new();
        host.put_file(PATH, "a", 0o644);
        let ops = FileOps::new(&host, sudo);

        ops.chmod(PATH, "0600").await.unwrap();
        ops.chown(PATH, "deploy").await.unwrap();
        ops.chgrp(PATH, "1001").await.unwrap();

        let calls = host.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(Call::is_command));

        let prefix = if sudo { "sudo " } else { "" };
        assert_eq!(calls[0], Call::Command(format!("{}chmod 0600 '/tmp/x'", prefix)));
        assert_eq!(calls[1], Call::Command(format!("{}chown 'deploy' '/tmp/x'", prefix)));

        let file = host.file(PATH).unwrap();
        assert_eq!((file.mode, file.uid, file.gid), (0o600, 1000, 1001));
    }
}

#[tokio::test]
async fn test_stat_reads() {
    let host = MockHost::new();
    host.put_file(PATH, "a", 0o644);
    let ops = FileOps::new(&host, false);
    ops.chown(PATH, "1000").await.unwrap();

    assert_eq!(ops.permissions(PATH).await.unwrap(), "0644");
    assert_eq!(ops.owner(PATH).await.unwrap(), "1000");
    assert_eq!(ops.group(PATH).await.unwrap(), "0");
    assert_eq!(ops.owner_name(PATH).await.unwrap(), "deploy");
    assert_eq!(ops.group_name(PATH).await.unwrap(), "root");

    ops.chmod(PATH, "1755").await.unwrap();
    assert_eq!(ops.permissions(PATH).await.unwrap(), "1755");
}

#[tokio::test]
async fn test_exists() {
    let host = MockHost::new();
    host.put_file(PATH, "a", 0o644);
    let ops = FileOps::new(&host, false);

    assert!(ops.exists(PATH).await.unwrap());
    assert_eq!(host.calls(), vec![Call::Command("test -f '/tmp/x'".to_string())]);

    host.clear_calls();
    assert!(!ops.exists("/tmp/missing").await.unwrap());
    assert_eq!(
        host.calls(),
        vec![
            Call::Command("test -f '/tmp/missing'".to_string()),
            Call::Command("test ! -f '/tmp/missing'".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_exists_errors_when_both_checks_fail() {
    let host = MockHost::new();
    host.deny(PATH);

    let err = FileOps::new(&host, true).exists(PATH).await.unwrap_err();
    assert_eq!(err.as_command().unwrap().command, "sudo test ! -f '/tmp/x'");
}

#[tokio::test]
async fn test_exists_channel_failure_is_hard_error() {
    let host = MockHost::new();
    host.set_broken(true);

    let err = FileOps::new(&host, false).exists(PATH).await.unwrap_err();
    assert!(!err.as_command().unwrap().exited());
    // No confirming check after a transport failure.
    assert_eq!(host.calls().len(), 1);
}

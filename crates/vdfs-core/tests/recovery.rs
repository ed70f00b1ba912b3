#![forbid(unsafe_code)]

use tempfile::TempDir;
use vdfs_core::{
    BitmapKind, EngineConfig, Fit, FsType, MkfsOptions, PartitionSpec, RecoveryReport, SizeUnit, Vdfs, VdfsError,
};

fn mounted(fs_type: FsType, config: EngineConfig) -> (TempDir, Vdfs) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("journal.mia");
    let password = config.root_password.clone();
    let mut engine = Vdfs::new(config).expect("engine");
    engine.mkdisk(&path, 1, SizeUnit::Mega, Fit::Best).expect("mkdisk");
    engine
        .fdisk_create(
            &path,
            &PartitionSpec {
                name: "data".to_owned(),
                size: 300,
                ..PartitionSpec::default()
            },
        )
        .expect("fdisk");
    engine.mount(&path, "data").expect("mount");
    engine.mkfs("891A", MkfsOptions { fs_type }).expect("mkfs");
    engine.login("root", &password, "891A").expect("login");
    (dir, engine)
}

#[test]
fn loss_and_recovery_round_trip() {
    let (_dir, engine) = mounted(FsType::Ext3, EngineConfig::default());
    engine.mkdir("/x", false).expect("mkdir");
    engine.mkfile("/x/f.txt", false, None, Some("hi")).expect("mkfile");

    let entries = engine.journaling("891A").expect("journal");
    let tail: Vec<(&str, &str, &str)> = entries[2..]
        .iter()
        .map(|e| (e.op.as_str(), e.path.as_str(), e.payload.as_str()))
        .collect();
    assert_eq!(tail, [("mkdir", "/x", ""), ("mkfile", "/x/f.txt", "hi")]);

    engine.loss("891A").expect("loss");
    let wiped = engine.bitmap_dump("891A", BitmapKind::Inode).expect("bitmap");
    assert_eq!(wiped.used, 0);
    assert!(engine.cat(&["/x/f.txt"]).is_err(), "tree is gone after loss");

    let report = engine.recovery("891A").expect("recovery");
    assert_eq!(
        report,
        RecoveryReport {
            replayed: 2,
            skipped: 2,
            failed: 0
        }
    );
    assert_eq!(engine.cat(&["/x/f.txt"]).expect("cat"), b"hi");
    assert_eq!(engine.superblock("891A").expect("sb").inodes_count, 4);
}

#[test]
fn recovery_resets_users_and_skips_other_ops() {
    let (_dir, mut engine) = mounted(FsType::Ext3, EngineConfig::default());
    engine.mkgrp("devs").expect("mkgrp");
    engine.mkusr("alice", "pw", "devs").expect("mkusr");
    engine.mkdir("/a", false).expect("mkdir");
    engine.mkfile("/a/f", false, Some(5), None).expect("mkfile");
    engine.rename("/a/f", "g").expect("rename");

    engine.loss("891A").expect("loss");
    let report = engine.recovery("891A").expect("recovery");
    assert_eq!(report.replayed, 2);
    assert_eq!(report.skipped, 5);

    // Renames are not replayed and users.txt is back to defaults.
    assert_eq!(engine.cat(&["/a/f"]).expect("cat"), b"01234");
    assert!(matches!(engine.cat(&["/a/g"]), Err(VdfsError::NotFound(_))));
    engine.logout().expect("logout");
    assert!(matches!(
        engine.login("alice", "pw", "891A"),
        Err(VdfsError::PermissionDenied(_))
    ));
}

#[test]
fn recovery_uses_configured_root_password() {
    let config = EngineConfig {
        root_password: "s3cret".to_owned(),
        ..EngineConfig::default()
    };
    let (_dir, mut engine) = mounted(FsType::Ext3, config);
    engine.loss("891A").expect("loss");
    engine.recovery("891A").expect("recovery");
    engine.logout().expect("logout");
    engine.login("root", "s3cret", "891A").expect("login after recovery");
}

#[test]
fn journal_is_bounded_by_config() {
    let config = EngineConfig {
        journal_entries: 4,
        ..EngineConfig::default()
    };
    let (_dir, engine) = mounted(FsType::Ext3, config);
    for i in 0..6 {
        engine.mkdir(&format!("/d{i}"), false).expect("mkdir");
    }
    let entries = engine.journaling("891A").expect("journal");
    assert_eq!(entries.len(), 4, "a full journal overwrites slot 0");
}

#[test]
fn ext2_has_no_journal() {
    let (_dir, engine) = mounted(FsType::Ext2, EngineConfig::default());
    engine.mkdir("/x", false).expect("mkdir");
    assert!(matches!(engine.journaling("891A"), Err(VdfsError::InvalidArgument(_))));
    assert!(matches!(engine.loss("891A"), Err(VdfsError::InvalidArgument(_))));
    assert!(matches!(engine.recovery("891A"), Err(VdfsError::InvalidArgument(_))));
    assert_eq!(engine.cat(&["/users.txt"]).expect("cat"), b"1,G,root\n1,U,root,root,123\n");
}

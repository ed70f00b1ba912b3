//! Dispatch of parsed commands onto the engine.

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use std::path::Path;
use vdfs::{
    BitmapKind, BlockContent, DeleteMode, Fit, FsType, MkfsOptions, PartitionInfo, PartitionKind, PartitionSpec,
    SizeUnit, TreeNode, UserRecord, Vdfs,
};

use crate::script::Command;

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    } else {
        let text = text();
        if !text.is_empty() {
            println!("{text}");
        }
    }
    Ok(())
}

fn done(json: bool, message: impl Into<String>) -> Result<()> {
    let message = message.into();
    emit(json, &serde_json::json!({ "ok": message }), || message.clone())
}

fn unit(cmd: &Command, default: SizeUnit) -> Result<SizeUnit> {
    cmd.optional("unit")
        .map_or(Ok(default), SizeUnit::parse)
        .context("invalid -unit")
}

fn fit(cmd: &Command, default: Fit) -> Result<Fit> {
    cmd.optional("fit").map_or(Ok(default), Fit::parse).context("invalid -fit")
}

fn required_number(cmd: &Command, key: &str) -> Result<i64> {
    cmd.number(key)?
        .ok_or_else(|| anyhow!("{} requires -{key}", cmd.name))
}

pub fn partition_table(rows: &[PartitionInfo]) -> String {
    let mut out = format!(
        "{:<4} {:<16} {:<9} {:<5} {:>10} {:>10} {:<7} {:<4}",
        "slot", "name", "kind", "fit", "start", "size", "mounted", "id"
    );
    for row in rows {
        let slot = row.slot.map_or_else(|| "-".to_owned(), |s| s.to_string());
        let fit = row.fit.map_or("-", |f| match f {
            Fit::Best => "BF",
            Fit::First => "FF",
            Fit::Worst => "WF",
        });
        out.push_str(&format!(
            "\n{slot:<4} {:<16} {:<9} {fit:<5} {:>10} {:>10} {:<7} {:<4}",
            row.name,
            format!("{:?}", row.kind),
            row.start,
            row.size,
            row.mounted,
            row.id
        ));
    }
    out
}

fn render_tree(node: &TreeNode, depth: usize, out: &mut String) {
    out.push_str(&format!(
        "{:indent$}{} [{}] {} {}:{} {}B\n",
        "",
        node.name,
        node.inode.0,
        String::from_utf8_lossy(&node.perm.as_bytes()),
        node.uid,
        node.gid,
        node.size,
        indent = depth * 2
    ));
    for child in &node.children {
        render_tree(child, depth + 1, out);
    }
}

fn report(engine: &Vdfs, cmd: &Command, json: bool) -> Result<()> {
    let id = cmd.required("id")?;
    let name = cmd.required("name")?.to_ascii_lowercase();
    match name.as_str() {
        "sb" => {
            let sb = engine.superblock(id)?;
            emit(json, &sb, || format!("{sb:#?}"))
        }
        "bm_inode" | "bm_block" => {
            let kind = if name == "bm_inode" {
                BitmapKind::Inode
            } else {
                BitmapKind::Block
            };
            let bitmap = engine.bitmap_dump(id, kind)?;
            emit(json, &bitmap, || {
                format!(
                    "{}used {} of {}",
                    bitmap.map, bitmap.used, bitmap.total
                )
            })
        }
        "inode" => {
            let inodes = engine.inode_dump(id)?;
            emit(json, &inodes, || {
                inodes
                    .iter()
                    .map(|r| {
                        format!(
                            "inode {}: {} perm={} uid={} gid={} size={}",
                            r.index.0,
                            r.inode.kind,
                            String::from_utf8_lossy(&r.inode.perm.as_bytes()),
                            r.inode.uid,
                            r.inode.gid,
                            r.inode.size
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        "block" => {
            let blocks = engine.block_dump(id)?;
            emit(json, &blocks, || {
                blocks
                    .iter()
                    .map(|b| match &b.content {
                        BlockContent::Folder { entries } => format!(
                            "block {} (folder of {}): {}",
                            b.index.0,
                            b.owner.0,
                            entries
                                .iter()
                                .filter(|e| !e.is_free())
                                .map(|e| format!("{}={}", e.name, e.inode))
                                .collect::<Vec<_>>()
                                .join(" ")
                        ),
                        BlockContent::File { text } => format!("block {} (file of {}): {text:?}", b.index.0, b.owner.0),
                        BlockContent::Pointer { pointers } => {
                            format!("block {} (pointers of {}): {pointers:?}", b.index.0, b.owner.0)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        "journaling" => {
            let entries = engine.journaling(id)?;
            emit(json, &entries, || {
                entries
                    .iter()
                    .map(|e| format!("{:>3} {:<7} {:<32} {:?}", e.count, e.op, e.path, e.payload))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        "disk" | "mbr" => {
            let entry = engine
                .mounted()
                .into_iter()
                .find(|e| e.id.eq_ignore_ascii_case(id))
                .ok_or_else(|| anyhow!("{id} is not mounted"))?;
            let rows = engine.list_partitions(&entry.disk)?;
            emit(json, &rows, || partition_table(&rows))
        }
        "tree" => {
            let tree = engine.tree(cmd.optional("path").unwrap_or("/"))?;
            emit(json, &tree, || {
                let mut out = String::new();
                render_tree(&tree, 0, &mut out);
                out.trim_end().to_owned()
            })
        }
        other => bail!("unknown report {other:?} (sb, bm_inode, bm_block, inode, block, journaling, disk, tree)"),
    }
}

fn fdisk(engine: &Vdfs, cmd: &Command, json: bool) -> Result<()> {
    let path = Path::new(cmd.required("path")?);
    let name = cmd.required("name")?;
    if let Some(mode) = cmd.optional("delete") {
        engine.fdisk_delete(path, name, DeleteMode::parse(mode)?)?;
        return done(json, format!("partition {name} deleted"));
    }
    if let Some(amount) = cmd.number("add")? {
        let info = engine.fdisk_resize(path, name, amount, unit(cmd, SizeUnit::Kilo)?)?;
        return emit(json, &info, || format!("partition {name} resized to {} bytes", info.size));
    }
    let spec = PartitionSpec {
        name: name.to_owned(),
        size: required_number(cmd, "size")?,
        unit: unit(cmd, SizeUnit::Kilo)?,
        kind: cmd
            .optional("type")
            .map_or(Ok(PartitionKind::Primary), PartitionKind::parse)
            .context("invalid -type")?,
        fit: fit(cmd, Fit::Worst)?,
    };
    let info = engine.fdisk_create(path, &spec)?;
    emit(json, &info, || {
        format!("partition {} created at {} ({} bytes)", info.name, info.start, info.size)
    })
}

fn mkfs(engine: &Vdfs, cmd: &Command, json: bool) -> Result<()> {
    let id = cmd.required("id")?;
    if let Some(kind) = cmd.optional("type").filter(|t| !t.eq_ignore_ascii_case("full")) {
        bail!("mkfs -type must be full, got {kind:?}");
    }
    let fs_type = cmd
        .optional("fs")
        .map_or(Ok(FsType::Ext2), FsType::parse)
        .context("invalid -fs")?;
    let sb = engine.mkfs(id, MkfsOptions { fs_type })?;
    emit(json, &sb, || {
        format!(
            "{id} formatted: {} inodes, {} blocks",
            sb.inodes_count + sb.free_inodes_count,
            sb.blocks_count + sb.free_blocks_count
        )
    })
}

/// Run one command against the engine, printing its result.
pub fn execute(engine: &mut Vdfs, cmd: &Command, json: bool) -> Result<()> {
    match cmd.name.as_str() {
        "mkdisk" => {
            let path = Path::new(cmd.required("path")?);
            let mbr = engine.mkdisk(
                path,
                required_number(cmd, "size")?,
                unit(cmd, SizeUnit::Mega)?,
                fit(cmd, Fit::First)?,
            )?;
            emit(json, &mbr, || format!("disk {} created ({} bytes)", path.display(), mbr.size))
        }
        "rmdisk" => {
            let path = cmd.required("path")?;
            engine.rmdisk(Path::new(path))?;
            done(json, format!("disk {path} removed"))
        }
        "fdisk" => fdisk(engine, cmd, json),
        "mount" => {
            let entry = engine.mount(Path::new(cmd.required("path")?), cmd.required("name")?)?;
            emit(json, &entry, || format!("{} mounted as {}", entry.partition, entry.id))
        }
        "unmount" => {
            let entry = engine.unmount(cmd.required("id")?)?;
            emit(json, &entry, || format!("{} unmounted", entry.id))
        }
        "mounted" => {
            let entries = engine.mounted();
            emit(json, &entries, || {
                entries
                    .iter()
                    .map(|e| format!("{} {} {}", e.id, e.disk.display(), e.partition))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        "mkfs" => mkfs(engine, cmd, json),
        "login" => {
            let session = engine.login(cmd.required("user")?, cmd.required("pass")?, cmd.required("id")?)?;
            emit(json, session, || format!("welcome {}", session.user))
        }
        "logout" => {
            let session = engine.logout()?;
            done(json, format!("goodbye {}", session.user))
        }
        "mkgrp" => {
            let id = engine.mkgrp(cmd.required("name")?)?;
            done(json, format!("group created with id {id}"))
        }
        "rmgrp" => {
            let members = engine.rmgrp(cmd.required("name")?)?;
            done(json, format!("group removed with {members} members"))
        }
        "mkusr" => {
            let id = engine.mkusr(cmd.required("user")?, cmd.required("pass")?, cmd.required("grp")?)?;
            done(json, format!("user created with id {id}"))
        }
        "rmusr" => {
            engine.rmusr(cmd.required("user")?)?;
            done(json, "user removed")
        }
        "chgrp" => {
            engine.chgrp(cmd.required("user")?, cmd.required("grp")?)?;
            done(json, "group changed")
        }
        "users" => {
            let records = engine.list_users()?;
            emit(json, &records, || {
                records
                    .iter()
                    .filter(|r| r.is_active())
                    .map(|r| match r {
                        UserRecord::Group { id, name } => format!("{id} G {name}"),
                        UserRecord::User { id, group, name, .. } => format!("{id} U {group} {name}"),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        "mkdir" => {
            let path = cmd.required("path")?;
            engine.mkdir(path, cmd.flag("p"))?;
            done(json, format!("{path} created"))
        }
        "mkfile" => {
            let path = cmd.required("path")?;
            engine.mkfile(path, cmd.flag("r"), cmd.number("size")?, cmd.optional("cont"))?;
            done(json, format!("{path} created"))
        }
        "cat" => {
            let files = cmd.numbered("file");
            if files.is_empty() {
                bail!("cat requires -file1");
            }
            let bytes = engine.cat(&files)?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            emit(json, &text, || text.clone())
        }
        "edit" => {
            let path = cmd.required("path")?;
            engine.edit(path, cmd.optional("cont").unwrap_or_default())?;
            done(json, format!("{path} updated"))
        }
        "remove" => {
            let path = cmd.required("path")?;
            let freed = engine.remove(path)?;
            done(json, format!("{path} removed ({freed} inodes)"))
        }
        "rename" => {
            engine.rename(cmd.required("path")?, cmd.required("name")?)?;
            done(json, "renamed")
        }
        "move" => {
            engine.mv(cmd.required("path")?, cmd.required("destino")?)?;
            done(json, "moved")
        }
        "copy" => {
            let report = engine.copy(cmd.required("path")?, cmd.required("destino")?)?;
            emit(json, &report, || {
                let mut text = format!("{} nodes copied", report.copied.len());
                for skipped in &report.skipped {
                    text.push_str(&format!("\nskipped {skipped}: not readable"));
                }
                text
            })
        }
        "chmod" => {
            let changed = engine.chmod(cmd.required("path")?, cmd.required("ugo")?, cmd.flag("r"))?;
            done(json, format!("{changed} nodes changed"))
        }
        "chown" => {
            let skipped = engine.chown(cmd.required("path")?, cmd.required("user")?, cmd.flag("r"))?;
            emit(json, &skipped, || {
                skipped
                    .iter()
                    .map(|path| format!("skipped {path}: not owned"))
                    .chain(std::iter::once("owner changed".to_owned()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        "find" => {
            let matches = engine.find(cmd.required("path")?, cmd.required("name")?)?;
            emit(json, &matches, || matches.join("\n"))
        }
        "journaling" => {
            let entries = engine.journaling(cmd.required("id")?)?;
            emit(json, &entries, || {
                entries
                    .iter()
                    .map(|e| format!("{:<7} {:<32} {:?}", e.op, e.path, e.payload))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        "loss" => {
            let id = cmd.required("id")?;
            engine.loss(id)?;
            done(json, format!("{id}: filesystem tables wiped"))
        }
        "recovery" => {
            let report = engine.recovery(cmd.required("id")?)?;
            emit(json, &report, || {
                format!(
                    "{} replayed, {} skipped, {} failed",
                    report.replayed, report.skipped, report.failed
                )
            })
        }
        "rep" => report(engine, cmd, json),
        other => bail!("unknown command: {other}"),
    }
}

//! Thin FUSE bridge adapter.
//!
//! `fuser::Filesystem` is a synchronous trait; every method here does
//! nothing but resolve an inode, block on the async core (C4/C5/C6)
//! through a captured `tokio::runtime::Handle`, and translate the
//! result into a FUSE reply. No filesystem logic lives in this file.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyWrite, Request,
};
use libc::ENOENT;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::directory::{self, Directory, Node, ROOT_MODE};
use crate::remote::BlobStore;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

struct InodeTable {
    name_to_ino: HashMap<String, u64>,
    ino_to_name: HashMap<u64, String>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        InodeTable {
            name_to_ino: HashMap::new(),
            ino_to_name: HashMap::new(),
            next_ino: 2,
        }
    }

    fn ino_for(&mut self, name: &str) -> u64 {
        if let Some(&ino) = self.name_to_ino.get(name) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.name_to_ino.insert(name.to_string(), ino);
        self.ino_to_name.insert(ino, name.to_string());
        ino
    }

    fn name_for(&self, ino: u64) -> Option<String> {
        self.ino_to_name.get(&ino).cloned()
    }
}

/// Root `fuser::Filesystem` implementation. Owns no core state itself
/// -- `directory`, `catalog`, and `store` are the same handles shared
/// with the background Synchroniser (C7) and Evictor (C8) tasks.
pub struct FragFs {
    directory: Arc<Directory>,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn BlobStore>,
    config: Config,
    rt: tokio::runtime::Handle,
    inodes: Mutex<InodeTable>,
}

impl FragFs {
    pub fn new(
        directory: Arc<Directory>,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn BlobStore>,
        config: Config,
        rt: tokio::runtime::Handle,
    ) -> Self {
        FragFs {
            directory,
            catalog,
            store,
            config,
            rt,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn root_attr(&self) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: (ROOT_MODE & 0o777) as u16,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    fn node_attr(&self, ino: u64, mode: u32, size: u64) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: (mode & 0o777) as u16,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }
}

impl Filesystem for FragFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };

        let node = self.rt.block_on(self.directory.lookup(name));
        let Some(node) = node else {
            reply.error(ENOENT);
            return;
        };

        let ino = self.inodes.lock().unwrap().ino_for(name);
        let size = self.rt.block_on(node.size());
        reply.entry(&TTL, &self.node_attr(ino, node.mode(), size), 0);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &self.root_attr());
            return;
        }

        let Some(name) = self.inodes.lock().unwrap().name_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        let node = self.rt.block_on(self.directory.lookup(&name));
        let Some(node) = node else {
            reply.error(ENOENT);
            return;
        };
        let size = self.rt.block_on(node.size());
        reply.attr(&TTL, &self.node_attr(ino, node.mode(), size));
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        if ino != ROOT_INO {
            reply.error(ENOENT);
            return;
        }

        let mut entries = vec![
            (ROOT_INO, FileType::Directory, ".".to_string()),
            (ROOT_INO, FileType::Directory, "..".to_string()),
        ];

        let children = self.rt.block_on(self.directory.list());
        let mut inodes = self.inodes.lock().unwrap();
        for (name, _node) in children {
            let ino = inodes.ino_for(&name);
            entries.push((ino, FileType::RegularFile, name));
        }
        drop(inodes);

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        if ino == ROOT_INO {
            reply.error(libc::EISDIR);
            return;
        }
        let write_requested = (flags & (libc::O_WRONLY | libc::O_RDWR)) != 0;
        let Some(name) = self.inodes.lock().unwrap().name_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        let node = self.rt.block_on(self.directory.lookup(&name));
        match node {
            Some(Node::Committed(_)) if write_requested => reply.error(libc::EROFS),
            Some(_) => reply.opened(0, 0),
            None => reply.error(ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(name) = self.inodes.lock().unwrap().name_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        let node = self.rt.block_on(self.directory.lookup(&name));
        let Some(node) = node else {
            reply.error(ENOENT);
            return;
        };

        let store = self.store.clone();
        match self
            .rt
            .block_on(directory::read(&node, offset as u64, size as u64, store))
        {
            Ok(bytes) => reply.data(&bytes),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(name) = self.inodes.lock().unwrap().name_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        let node = self.rt.block_on(self.directory.lookup(&name));
        let Some(node) = node else {
            reply.error(ENOENT);
            return;
        };

        match self.rt.block_on(directory::write(&node, data)) {
            Ok(()) => reply.written(data.len() as u32),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        if parent != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };

        self.rt
            .block_on(self.directory.create(name, mode, self.config.chunk_size, self.store.clone()));

        let ino = self.inodes.lock().unwrap().ino_for(name);
        reply.created(&TTL, &self.node_attr(ino, mode, 0), 0, 0, 0);
    }

    fn flush(&mut self, _req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(name) = self.inodes.lock().unwrap().name_for(ino) else {
            reply.ok();
            return;
        };
        let node = self.rt.block_on(self.directory.lookup(&name));
        if let Some(Node::InProgress(streamer, _)) = node {
            let tmp_dir = self.config.tmp_dir.clone();
            let catalog = self.catalog.clone();
            let result = self.rt.block_on(streamer.flush(catalog.as_ref(), &tmp_dir));
            match result {
                Ok(file) => {
                    self.rt.block_on(self.directory.commit(&name, file));
                    reply.ok();
                }
                Err(err) => reply.error(err.to_errno()),
            }
        } else {
            reply.ok();
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        // Not part of the core: files only disappear once the
        // Synchroniser notices they vanished from the catalog.
        reply.error(libc::ENOSYS);
    }
}

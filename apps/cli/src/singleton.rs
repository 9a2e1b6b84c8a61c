//! 服务端单例锁
//!
//! 同一台机器上只能有一个 `serve` 进程占用 GPIO。锁文件保存持有者 PID，
//! 第二个进程启动失败时据此报告是谁占用了硬件。

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const LOCK_FILE_NAME: &str = "pendule-server.lock";

#[derive(Error, Debug)]
pub enum LockError {
    /// 另一个进程持有锁；PID 读不出时为 `None`
    #[error("pendule server already running{}", holder_suffix(.holder))]
    Held { holder: Option<u32> },

    #[error("lock file I/O error: {0}")]
    Io(#[from] io::Error),
}

fn holder_suffix(holder: &Option<u32>) -> String {
    holder.map(|pid| format!(" (pid {})", pid)).unwrap_or_default()
}

/// 服务端单例锁，Drop 时释放
///
/// 进程崩溃时操作系统回收 flock，锁文件残留也不会阻止下次启动。
pub struct ServerLock {
    file: File,
    path: PathBuf,
}

impl ServerLock {
    /// 非阻塞获取锁并写入当前 PID
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Err(LockError::Held {
                holder: read_holder(&mut file),
            });
        }

        // 持锁后才覆盖上一任持有者的 PID
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ServerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

/// 默认锁文件路径
///
/// 依次尝试 `XDG_RUNTIME_DIR`、`/tmp`、`~/.cache/pendule`，最后退回系统临时目录。
pub fn default_lock_file() -> PathBuf {
    let runtime = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
    let home_cache = std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".cache").join("pendule"));

    let candidates = [runtime, Some(PathBuf::from("/tmp"))];
    if let Some(dir) = candidates.into_iter().flatten().find(|dir| dir.is_dir()) {
        return dir.join(LOCK_FILE_NAME);
    }
    if let Some(dir) = home_cache {
        if std::fs::create_dir_all(&dir).is_ok() {
            return dir.join(LOCK_FILE_NAME);
        }
    }
    std::env::temp_dir().join(LOCK_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_writes_pid_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("server.lock");

        let lock = ServerLock::acquire(&lock_path).unwrap();
        assert_eq!(lock.path(), lock_path.as_path());
        drop(lock);

        let content = fs::read_to_string(&lock_path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        // 释放后可再次获取
        drop(ServerLock::acquire(&lock_path).unwrap());
    }

    #[test]
    fn test_second_server_sees_holder_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("server.lock");

        let _held = ServerLock::acquire(&lock_path).unwrap();
        let err = ServerLock::acquire(&lock_path).err().unwrap();
        let pid = std::process::id();
        assert!(matches!(err, LockError::Held { holder: Some(p) } if p == pid), "{}", err);
        assert!(err.to_string().contains(&format!("pid {}", pid)));
    }

    #[test]
    fn test_unreadable_holder_still_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("server.lock");
        fs::write(&lock_path, "not a pid\n").unwrap();

        let held = File::open(&lock_path).unwrap();
        assert!(held.try_lock_exclusive().unwrap());
        let err = ServerLock::acquire(&lock_path).err().unwrap();
        assert!(matches!(err, LockError::Held { holder: None }), "{}", err);
        assert_eq!(err.to_string(), "pendule server already running");
    }

    #[test]
    fn test_default_lock_file_name() {
        assert!(default_lock_file().ends_with(LOCK_FILE_NAME));
    }
}

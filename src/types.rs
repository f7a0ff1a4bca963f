//! Core types shared across the store, the cache engine, and the indexer.

/// Cache lifecycle of one entry. Persisted as an integer in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    NoCached = 0,
    Caching = 1,
    Cached = 2,
}

impl State {
    /// Integer form used in the database.
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    /// Parse the database integer form. Unknown values map to `None`.
    pub fn from_raw(v: i64) -> Option<State> {
        match v {
            0 => Some(State::NoCached),
            1 => Some(State::Caching),
            2 => Some(State::Cached),
            _ => None,
        }
    }
}

/// Stat group copied byte-for-byte from the source tree at index time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatRow {
    pub mode: u32,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
}

impl StatRow {
    /// True for regular files.
    pub fn is_file(&self) -> bool {
        mode_is_file(self.mode)
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFDIR
    }
}

/// True when the raw mode bits describe a regular file.
pub fn mode_is_file(mode: u32) -> bool {
    (mode & libc::S_IFMT) == libc::S_IFREG
}

/// One row in the metadata store: one path in the virtual tree.
#[derive(Clone, Debug)]
pub struct Entry {
    /// Dense id; primary key, inode number, and cache filename.
    pub id: i64,
    /// Id of the parent entry; the root uses -1.
    pub parent_id: i64,
    /// Canonical virtual path with a leading `/`.
    pub path: String,
    /// Basename.
    pub name: String,
    pub state: State,
    /// Seconds of the most recent open; none until first access.
    pub last_access_ts: Option<i64>,
    /// Media duration in seconds for probeable regular files.
    pub duration: Option<i64>,
    pub stat: StatRow,
}

/// Sentinel parent id of the root entry.
pub const ROOT_PARENT_ID: i64 = -1;

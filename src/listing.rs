//! Parsing of raw `LIST` output into [`DirectoryEntry`] values.
//!
//! Two line layouts are understood: the Unix `ls -l` style most servers
//! emit, and the DOS/IIS style (`01-06-20  02:28PM  25504938  data.csv`).
//! Lines that match neither layout (totals, banners, `<DIR>` rows) are
//! dropped, as are lines whose numbers or dates do not convert.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::trace;

lazy_static! {
    static ref UNIX_LINE: Regex = Regex::new(concat!(
        r"^(\S)",                         // type flag
        r"((?:[r-][w-][-xsStT]){3})\s+",  // permissions
        r"(\d+)\s+",                      // link count
        r"([A-Za-z0-9_-]+)\s+",           // owner
        r"([A-Za-z0-9_-]+)\s+",           // group
        r"(\d+)\s+",                      // size in bytes
        r"([A-Za-z]{3})\s+(\d{1,2})\s+",  // month, day
        r"(\d{1,2}:\d{1,2}|\d{4})\s+",    // time or year
        r"(.+)$",                         // name
    ))
    .expect("unix listing pattern is valid");

    static ref DOS_LINE: Regex =
        Regex::new(r"^(\d{2})-(\d{2})-(\d{2})\s+(\d{2}):(\d{2})(AM|PM)\s+(\d+)\s+(.+)$")
            .expect("dos listing pattern is valid");
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Classification taken from the first column of a Unix listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Pipe,
    Socket,
    Unknown(char),
}

impl EntryKind {
    pub fn from_flag(flag: char) -> Self {
        match flag {
            '-' => EntryKind::File,
            'd' => EntryKind::Directory,
            'l' => EntryKind::Symlink,
            'b' => EntryKind::BlockDevice,
            'c' => EntryKind::CharDevice,
            'p' => EntryKind::Pipe,
            's' => EntryKind::Socket,
            other => EntryKind::Unknown(other),
        }
    }

    pub fn flag(&self) -> char {
        match self {
            EntryKind::File => '-',
            EntryKind::Directory => 'd',
            EntryKind::Symlink => 'l',
            EntryKind::BlockDevice => 'b',
            EntryKind::CharDevice => 'c',
            EntryKind::Pipe => 'p',
            EntryKind::Socket => 's',
            EntryKind::Unknown(c) => *c,
        }
    }
}

/// Layout-specific columns of a listing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingFormat {
    Unix {
        permissions: String,
        link_count: u32,
        owner: String,
        group: String,
    },
    Dos,
}

/// One parsed listing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub timestamp: NaiveDateTime,
    pub name: String,
    pub format: ListingFormat,
}

impl DirectoryEntry {
    pub fn permissions(&self) -> Option<&str> {
        match &self.format {
            ListingFormat::Unix { permissions, .. } => Some(permissions),
            ListingFormat::Dos => None,
        }
    }

    pub fn link_count(&self) -> Option<u32> {
        match &self.format {
            ListingFormat::Unix { link_count, .. } => Some(*link_count),
            ListingFormat::Dos => None,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match &self.format {
            ListingFormat::Unix { owner, .. } => Some(owner),
            ListingFormat::Dos => None,
        }
    }

    pub fn group(&self) -> Option<&str> {
        match &self.format {
            ListingFormat::Unix { group, .. } => Some(group),
            ListingFormat::Dos => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// `.` and `..` pseudo entries
    pub fn is_relative(&self) -> bool {
        is_relative_name(&self.name)
    }
}

pub fn is_relative_name(name: &str) -> bool {
    name == "." || name == ".."
}

/// Parse listing lines, resolving omitted years against today's local date.
pub fn parse_listing<I, S>(lines: I) -> Vec<DirectoryEntry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parse_listing_at(lines, Local::now().date_naive())
}

/// Parse listing lines, resolving omitted years against `today`.
pub fn parse_listing_at<I, S>(lines: I, today: NaiveDate) -> Vec<DirectoryEntry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| parse_line(line.as_ref(), today))
        .collect()
}

/// Parse a single line; `None` when it is not a recognisable entry.
pub fn parse_line(line: &str, today: NaiveDate) -> Option<DirectoryEntry> {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(caps) = UNIX_LINE.captures(line) {
        let entry = unix_entry(&caps, today);
        if entry.is_none() {
            trace!("Dropping unconvertible unix listing line: {}", line);
        }
        return entry;
    }

    if let Some(caps) = DOS_LINE.captures(line) {
        let entry = dos_entry(&caps);
        if entry.is_none() {
            trace!("Dropping unconvertible dos listing line: {}", line);
        }
        return entry;
    }

    trace!("Ignoring unrecognised listing line: {}", line);
    None
}

fn unix_entry(caps: &Captures<'_>, today: NaiveDate) -> Option<DirectoryEntry> {
    let flag = caps[1].chars().next()?;
    let link_count = caps[3].parse::<u32>().ok()?;
    let size = caps[6].parse::<u64>().ok()?;
    let month = month_number(&caps[7])?;
    let day = caps[8].parse::<u32>().ok()?;
    let time_or_year = &caps[9];

    let (year, time) = match time_or_year.split_once(':') {
        Some((hour, minute)) => {
            let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
            (infer_year(month, day, today), time)
        }
        None => (
            time_or_year.parse::<i32>().ok()?,
            NaiveTime::from_hms_opt(0, 0, 0)?,
        ),
    };

    let date = NaiveDate::from_ymd_opt(year, month, day)?;

    Some(DirectoryEntry {
        kind: EntryKind::from_flag(flag),
        size,
        timestamp: date.and_time(time),
        name: caps[10].to_string(),
        format: ListingFormat::Unix {
            permissions: caps[2].to_string(),
            link_count,
            owner: caps[4].to_string(),
            group: caps[5].to_string(),
        },
    })
}

fn dos_entry(caps: &Captures<'_>) -> Option<DirectoryEntry> {
    let month = caps[1].parse::<u32>().ok()?;
    let day = caps[2].parse::<u32>().ok()?;
    let year = 2000 + caps[3].parse::<i32>().ok()?;
    let hour = to_24_hour(caps[4].parse::<u32>().ok()?, &caps[6]);
    let minute = caps[5].parse::<u32>().ok()?;
    let size = caps[7].parse::<u64>().ok()?;

    let timestamp = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;

    Some(DirectoryEntry {
        kind: EntryKind::File,
        size,
        timestamp,
        name: caps[8].to_string(),
        format: ListingFormat::Dos,
    })
}

/// Listings drop the year for entries from roughly the last twelve months,
/// so a month/day still ahead of `today` belongs to the previous year.
fn infer_year(month: u32, day: u32, today: NaiveDate) -> i32 {
    if (month, day) > (today.month(), today.day()) {
        today.year() - 1
    } else {
        today.year()
    }
}

fn to_24_hour(hour: u32, meridiem: &str) -> u32 {
    match (meridiem, hour) {
        ("PM", 12) => 12,
        ("PM", h) => h + 12,
        ("AM", 12) => 0,
        (_, h) => h,
    }
}

fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|idx| idx as u32 + 1)
}

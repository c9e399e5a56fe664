use crate::Error;
use std::{fmt, fs, path::Path, str::FromStr};

/// Flash sector size; partitions are expected to start on a sector boundary.
const ERASE_BLOCK: u32 = 0x1000;
const MIN_FIELDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub name: String,
    pub r#type: String,
    pub subtype: String,
    pub offset: u32,
    pub size: u32,
    pub flags: Vec<String>,
}

impl PartitionRecord {
    pub fn new(name: impl Into<String>, offset: u32, size: u32) -> Self {
        PartitionRecord {
            name: name.into(),
            r#type: String::new(),
            subtype: String::new(),
            offset,
            size,
            flags: Vec::new(),
        }
    }

    /// First address past the partition. Parsing guarantees this fits in `u32`.
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &PartitionRecord) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl fmt::Display for PartitionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: offset={:#x}, size={:#x}",
            self.name, self.offset, self.size
        )
    }
}

/// Partition table parsed from an ESP-IDF style CSV file.
///
/// Rows are `name, type, subtype, offset, size[, flags]`. Blank lines and
/// lines starting with `#` are ignored. Any bad row rejects the whole table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    records: Vec<PartitionRecord>,
}

impl PartitionTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(Error::artifact(path))?;
        text.parse()
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut records: Vec<PartitionRecord> = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = parse_row(index + 1, line)?;
            if records.iter().any(|r| r.name == record.name) {
                return Err(Error::DuplicatePartition(record.name));
            }
            if record.offset % ERASE_BLOCK != 0 {
                log::warn!(
                    "partition {} offset {:#x} is not aligned to {:#x}",
                    record.name,
                    record.offset,
                    ERASE_BLOCK
                );
            }
            records.push(record);
        }

        let mut sorted: Vec<&PartitionRecord> = records.iter().collect();
        sorted.sort_by_key(|r| r.offset);
        check_disjoint(sorted)?;

        Ok(PartitionTable { records })
    }

    pub fn records(&self) -> &[PartitionRecord] {
        &self.records
    }

    pub fn find(&self, name: &str) -> Option<&PartitionRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromStr for PartitionTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PartitionTable::parse(s)
    }
}

/// Rejects the first pair of records, in offset order, whose ranges intersect.
pub(crate) fn check_disjoint<'a>(
    sorted: impl IntoIterator<Item = &'a PartitionRecord>,
) -> Result<(), Error> {
    let mut prev: Option<&PartitionRecord> = None;
    for record in sorted {
        if let Some(prev) = prev {
            if prev.overlaps(record) {
                return Err(overlap_error(prev, record));
            }
        }
        prev = Some(record);
    }
    Ok(())
}

/// `Overlap` naming the lower of the two records first.
pub(crate) fn overlap_error(a: &PartitionRecord, b: &PartitionRecord) -> Error {
    let (first, second) = if a.offset <= b.offset { (a, b) } else { (b, a) };
    Error::Overlap {
        first: first.name.clone(),
        first_start: first.offset,
        first_end: first.end(),
        second: second.name.clone(),
        second_start: second.offset,
        second_end: second.end(),
    }
}

fn parse_row(line: usize, row: &str) -> Result<PartitionRecord, Error> {
    let malformed = |reason: String| Error::MalformedTable { line, reason };

    let fields: Vec<&str> = row.split(',').map(str::trim).collect();
    let populated = fields
        .iter()
        .take(MIN_FIELDS)
        .take_while(|f| !f.is_empty())
        .count();
    if populated < MIN_FIELDS {
        return Err(malformed(format!(
            "expected {} populated fields (name, type, subtype, offset, size), found {}",
            MIN_FIELDS, populated
        )));
    }

    let offset = parse_number(fields[3])
        .ok_or_else(|| malformed(format!("invalid offset `{}`", fields[3])))?;
    let size =
        parse_number(fields[4]).ok_or_else(|| malformed(format!("invalid size `{}`", fields[4])))?;
    if size == 0 {
        return Err(malformed(format!("partition `{}` has zero size", fields[0])));
    }
    if offset.checked_add(size).is_none() {
        return Err(malformed(format!(
            "partition `{}` extends past the 32-bit address space",
            fields[0]
        )));
    }

    let flags = fields[MIN_FIELDS..]
        .iter()
        .filter(|f| !f.is_empty())
        .map(|f| f.to_string())
        .collect();

    Ok(PartitionRecord {
        name: fields[0].to_string(),
        r#type: fields[1].to_string(),
        subtype: fields[2].to_string(),
        offset,
        size,
        flags,
    })
}

/// Decimal or `0x` hex, with an optional `K`/`M` multiplier.
fn parse_number(field: &str) -> Option<u32> {
    let (digits, scale) = match field.chars().last()? {
        'K' | 'k' => (&field[..field.len() - 1], 1024),
        'M' | 'm' => (&field[..field.len() - 1], 1024 * 1024),
        _ => (field, 1),
    };
    let digits = digits.trim();
    let (digits, radix) = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (digits, 10),
    };
    // `from_str_radix` would also take a leading `+`
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()?.checked_mul(scale)
}

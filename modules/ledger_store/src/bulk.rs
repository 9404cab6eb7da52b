//! Binary bulk-load format.
//!
//! The layout is the one used by `COPY ... FROM STDIN (FORMAT BINARY)`:
//! an 11-byte signature, an i32 flags field and an i32 header extension
//! length, then one record per row (i16 field count followed by an i32
//! byte length and the big-endian value for each field, -1 for null) and
//! finally an i16 trailer of -1.

use bakehouse_common::{
    AccountId, BakingRight, Level, RightKind, RightStatus, SnapshotBalance,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";
const TRAILER: i16 = -1;
const NULL_LENGTH: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BulkError {
    #[error("Bad bulk signature")]
    BadSignature,

    #[error("Unexpected end of bulk stream")]
    Truncated,

    #[error("Row {row} has {found} fields, table {table} expects {expected}")]
    FieldCount {
        table: &'static str,
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("Column {column} of {table} is {expected:?}, got {found:?}")]
    ColumnType {
        table: &'static str,
        column: &'static str,
        expected: ColumnType,
        found: ColumnType,
    },

    #[error("Column {column} of {table} is not nullable")]
    NotNullable {
        table: &'static str,
        column: &'static str,
    },

    #[error("Field of {length} bytes does not match column {column} ({expected:?})")]
    FieldLength {
        column: &'static str,
        expected: ColumnType,
        length: i32,
    },

    #[error("Value {value} out of range for column {column}")]
    OutOfRange { column: &'static str, value: i64 },

    #[error("Write outside of a row")]
    NoRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int16,
    Int32,
    Int64,
}

impl ColumnType {
    fn width(self) -> i32 {
        match self {
            ColumnType::Int16 => 2,
            ColumnType::Int32 => 4,
            ColumnType::Int64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

const fn col(name: &'static str, ty: ColumnType, nullable: bool) -> Column {
    Column { name, ty, nullable }
}

const BAKING_RIGHTS_COLUMNS: &[Column] = &[
    col("cycle", ColumnType::Int32, false),
    col("level", ColumnType::Int32, false),
    col("baker_id", ColumnType::Int32, false),
    col("kind", ColumnType::Int16, false),
    col("round", ColumnType::Int32, true),
    col("slots", ColumnType::Int32, true),
    col("status", ColumnType::Int16, false),
];

const SNAPSHOT_BALANCES_COLUMNS: &[Column] = &[
    col("level", ColumnType::Int32, false),
    col("account_id", ColumnType::Int32, false),
    col("baker_id", ColumnType::Int32, false),
    col("own_delegated_balance", ColumnType::Int64, false),
    col("external_delegated_balance", ColumnType::Int64, false),
    col("delegators_count", ColumnType::Int32, false),
    col("own_staked_balance", ColumnType::Int64, false),
    col("external_staked_balance", ColumnType::Int64, false),
    col("stakers_count", ColumnType::Int32, false),
];

/// Tables reachable through the bulk path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkTable {
    BakingRights,
    SnapshotBalances,
}

impl BulkTable {
    pub fn name(self) -> &'static str {
        match self {
            BulkTable::BakingRights => "baking_rights",
            BulkTable::SnapshotBalances => "snapshot_balances",
        }
    }

    pub fn columns(self) -> &'static [Column] {
        match self {
            BulkTable::BakingRights => BAKING_RIGHTS_COLUMNS,
            BulkTable::SnapshotBalances => SNAPSHOT_BALANCES_COLUMNS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Null,
}

/// A finished bulk stream, ready to be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPayload {
    pub table: BulkTable,
    pub rows: usize,
    pub data: Bytes,
}

/// Streams rows into the binary format one typed field at a time
pub struct BinaryCopyWriter {
    table: BulkTable,
    buf: BytesMut,
    rows: usize,
    column: Option<usize>,
}

impl BinaryCopyWriter {
    pub fn new(table: BulkTable) -> Self {
        let mut buf = BytesMut::with_capacity(1024);
        buf.put_slice(SIGNATURE);
        buf.put_i32(0); // flags
        buf.put_i32(0); // header extension length
        Self {
            table,
            buf,
            rows: 0,
            column: None,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn start_row(&mut self) -> Result<(), BulkError> {
        self.end_row()?;
        let columns = self.table.columns();
        self.buf.put_i16(columns.len() as i16);
        self.column = Some(0);
        Ok(())
    }

    fn end_row(&mut self) -> Result<(), BulkError> {
        if let Some(found) = self.column.take() {
            let expected = self.table.columns().len();
            if found != expected {
                return Err(BulkError::FieldCount {
                    table: self.table.name(),
                    row: self.rows,
                    found,
                    expected,
                });
            }
            self.rows += 1;
        }
        Ok(())
    }

    fn next_column(&mut self, found: Option<ColumnType>) -> Result<(), BulkError> {
        let index = self.column.ok_or(BulkError::NoRow)?;
        let columns = self.table.columns();
        let Some(column) = columns.get(index) else {
            return Err(BulkError::FieldCount {
                table: self.table.name(),
                row: self.rows,
                found: index + 1,
                expected: columns.len(),
            });
        };
        match found {
            Some(ty) if ty != column.ty => {
                return Err(BulkError::ColumnType {
                    table: self.table.name(),
                    column: column.name,
                    expected: column.ty,
                    found: ty,
                })
            }
            None if !column.nullable => {
                return Err(BulkError::NotNullable {
                    table: self.table.name(),
                    column: column.name,
                })
            }
            _ => {}
        }
        self.column = Some(index + 1);
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), BulkError> {
        self.next_column(Some(ColumnType::Int16))?;
        self.buf.put_i32(2);
        self.buf.put_i16(value);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), BulkError> {
        self.next_column(Some(ColumnType::Int32))?;
        self.buf.put_i32(4);
        self.buf.put_i32(value);
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), BulkError> {
        self.next_column(Some(ColumnType::Int64))?;
        self.buf.put_i32(8);
        self.buf.put_i64(value);
        Ok(())
    }

    pub fn write_null(&mut self) -> Result<(), BulkError> {
        self.next_column(None)?;
        self.buf.put_i32(NULL_LENGTH);
        Ok(())
    }

    pub fn write_opt_i32(&mut self, value: Option<i32>) -> Result<(), BulkError> {
        match value {
            Some(v) => self.write_i32(v),
            None => self.write_null(),
        }
    }

    /// Close the stream
    pub fn finish(mut self) -> Result<BulkPayload, BulkError> {
        self.end_row()?;
        self.buf.put_i16(TRAILER);
        Ok(BulkPayload {
            table: self.table,
            rows: self.rows,
            data: self.buf.freeze(),
        })
    }
}

/// Reads rows back out of a bulk payload
pub struct BinaryCopyReader {
    table: BulkTable,
    data: Bytes,
    row: usize,
    done: bool,
}

impl BinaryCopyReader {
    pub fn new(payload: &BulkPayload) -> Result<Self, BulkError> {
        let mut data = payload.data.clone();
        if data.remaining() < SIGNATURE.len() + 8 {
            return Err(BulkError::Truncated);
        }
        if &data[..SIGNATURE.len()] != SIGNATURE {
            return Err(BulkError::BadSignature);
        }
        data.advance(SIGNATURE.len());
        let _flags = data.get_i32();
        let extension = data.get_i32();
        if extension < 0 || data.remaining() < extension as usize {
            return Err(BulkError::Truncated);
        }
        data.advance(extension as usize);
        Ok(Self {
            table: payload.table,
            data,
            row: 0,
            done: false,
        })
    }

    fn read_row(&mut self) -> Result<Option<Vec<BulkValue>>, BulkError> {
        if self.data.remaining() < 2 {
            return Err(BulkError::Truncated);
        }
        let count = self.data.get_i16();
        if count == TRAILER {
            return Ok(None);
        }
        let columns = self.table.columns();
        if count as usize != columns.len() {
            return Err(BulkError::FieldCount {
                table: self.table.name(),
                row: self.row,
                found: count.max(0) as usize,
                expected: columns.len(),
            });
        }

        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            if self.data.remaining() < 4 {
                return Err(BulkError::Truncated);
            }
            let length = self.data.get_i32();
            if length == NULL_LENGTH {
                if !column.nullable {
                    return Err(BulkError::NotNullable {
                        table: self.table.name(),
                        column: column.name,
                    });
                }
                values.push(BulkValue::Null);
                continue;
            }
            if length != column.ty.width() {
                return Err(BulkError::FieldLength {
                    column: column.name,
                    expected: column.ty,
                    length,
                });
            }
            if self.data.remaining() < length as usize {
                return Err(BulkError::Truncated);
            }
            values.push(match column.ty {
                ColumnType::Int16 => BulkValue::Int16(self.data.get_i16()),
                ColumnType::Int32 => BulkValue::Int32(self.data.get_i32()),
                ColumnType::Int64 => BulkValue::Int64(self.data.get_i64()),
            });
        }
        self.row += 1;
        Ok(Some(values))
    }
}

impl Iterator for BinaryCopyReader {
    type Item = Result<Vec<BulkValue>, BulkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Rows that can travel through the bulk path
pub trait BulkRow: Sized {
    const TABLE: BulkTable;

    fn write(&self, writer: &mut BinaryCopyWriter) -> Result<(), BulkError>;
    fn read(values: &[BulkValue]) -> Result<Self, BulkError>;
}

pub fn encode_rows<R: BulkRow>(rows: &[R]) -> Result<BulkPayload, BulkError> {
    let mut writer = BinaryCopyWriter::new(R::TABLE);
    for row in rows {
        writer.start_row()?;
        row.write(&mut writer)?;
    }
    writer.finish()
}

pub fn decode_rows<R: BulkRow>(payload: &BulkPayload) -> Result<Vec<R>, BulkError> {
    BinaryCopyReader::new(payload)?.map(|row| R::read(&row?)).collect()
}

struct Fields<'a> {
    table: BulkTable,
    values: &'a [BulkValue],
    index: usize,
}

impl<'a> Fields<'a> {
    fn new(table: BulkTable, values: &'a [BulkValue]) -> Self {
        Self {
            table,
            values,
            index: 0,
        }
    }

    fn column(&self) -> &'static str {
        self.table.columns().get(self.index).map(|c| c.name).unwrap_or("?")
    }

    fn next(&mut self) -> Result<BulkValue, BulkError> {
        let value = self.values.get(self.index).copied().ok_or(BulkError::FieldCount {
            table: self.table.name(),
            row: 0,
            found: self.values.len(),
            expected: self.table.columns().len(),
        })?;
        self.index += 1;
        Ok(value)
    }

    fn mismatch(&self, expected: ColumnType, found: BulkValue) -> BulkError {
        let found = match found {
            BulkValue::Int16(_) => ColumnType::Int16,
            BulkValue::Int32(_) => ColumnType::Int32,
            BulkValue::Int64(_) | BulkValue::Null => ColumnType::Int64,
        };
        BulkError::ColumnType {
            table: self.table.name(),
            column: self.column(),
            expected,
            found,
        }
    }

    fn i16(&mut self) -> Result<i16, BulkError> {
        match self.next()? {
            BulkValue::Int16(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Int16, other)),
        }
    }

    fn i32(&mut self) -> Result<i32, BulkError> {
        match self.next()? {
            BulkValue::Int32(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Int32, other)),
        }
    }

    fn opt_i32(&mut self) -> Result<Option<i32>, BulkError> {
        match self.next()? {
            BulkValue::Int32(v) => Ok(Some(v)),
            BulkValue::Null => Ok(None),
            other => Err(self.mismatch(ColumnType::Int32, other)),
        }
    }

    fn i64(&mut self) -> Result<i64, BulkError> {
        match self.next()? {
            BulkValue::Int64(v) => Ok(v),
            other => Err(self.mismatch(ColumnType::Int64, other)),
        }
    }
}

impl BulkRow for BakingRight {
    const TABLE: BulkTable = BulkTable::BakingRights;

    fn write(&self, writer: &mut BinaryCopyWriter) -> Result<(), BulkError> {
        writer.write_i32(self.cycle)?;
        writer.write_i32(self.level)?;
        writer.write_i32(self.baker_id.0)?;
        writer.write_i16(self.kind.code())?;
        writer.write_opt_i32(self.round)?;
        writer.write_opt_i32(self.slots)?;
        writer.write_i16(self.status.code())
    }

    fn read(values: &[BulkValue]) -> Result<Self, BulkError> {
        let mut f = Fields::new(Self::TABLE, values);
        let cycle = f.i32()?;
        let level: Level = f.i32()?;
        let baker_id = AccountId(f.i32()?);
        let kind_code = f.i16()?;
        let kind = RightKind::from_code(kind_code).ok_or(BulkError::OutOfRange {
            column: "kind",
            value: kind_code as i64,
        })?;
        let round = f.opt_i32()?;
        let slots = f.opt_i32()?;
        let status_code = f.i16()?;
        let status = RightStatus::from_code(status_code).ok_or(BulkError::OutOfRange {
            column: "status",
            value: status_code as i64,
        })?;
        Ok(BakingRight {
            cycle,
            level,
            baker_id,
            kind,
            round,
            slots,
            status,
        })
    }
}

impl BulkRow for SnapshotBalance {
    const TABLE: BulkTable = BulkTable::SnapshotBalances;

    fn write(&self, writer: &mut BinaryCopyWriter) -> Result<(), BulkError> {
        writer.write_i32(self.level)?;
        writer.write_i32(self.account_id.0)?;
        writer.write_i32(self.baker_id.0)?;
        writer.write_i64(self.own_delegated_balance)?;
        writer.write_i64(self.external_delegated_balance)?;
        writer.write_i32(self.delegators_count)?;
        writer.write_i64(self.own_staked_balance)?;
        writer.write_i64(self.external_staked_balance)?;
        writer.write_i32(self.stakers_count)
    }

    fn read(values: &[BulkValue]) -> Result<Self, BulkError> {
        let mut f = Fields::new(Self::TABLE, values);
        Ok(SnapshotBalance {
            level: f.i32()?,
            account_id: AccountId(f.i32()?),
            baker_id: AccountId(f.i32()?),
            own_delegated_balance: f.i64()?,
            external_delegated_balance: f.i64()?,
            delegators_count: f.i32()?,
            own_staked_balance: f.i64()?,
            external_staked_balance: f.i64()?,
            stakers_count: f.i32()?,
        })
    }
}

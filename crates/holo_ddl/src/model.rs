//! In-memory schema objects stored by the metadata store.
//!
//! Names keep the case the user wrote; every lookup compares ASCII
//! case-insensitively.

use std::fmt;

use holo_session::quote_ident;
use serde::{Deserialize, Serialize};

/// Online schema-change lifecycle stage of a schema object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchemaState {
    #[default]
    None,
    DeleteOnly,
    WriteOnly,
    WriteReorganization,
    Public,
}

impl fmt::Display for SchemaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaState::None => "none",
            SchemaState::DeleteOnly => "delete only",
            SchemaState::WriteOnly => "write only",
            SchemaState::WriteReorganization => "write reorganization",
            SchemaState::Public => "public",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub id: i64,
    pub name: String,
    pub state: SchemaState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Tiny,
    Short,
    Long,
    LongLong,
    Float,
    Double,
    NewDecimal,
    Varchar,
    Char,
    Blob,
    Date,
    Datetime,
    Timestamp,
    Json,
}

impl ColumnType {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::Tiny | ColumnType::Short | ColumnType::Long | ColumnType::LongLong
        )
    }

    fn is_string(self) -> bool {
        matches!(self, ColumnType::Varchar | ColumnType::Char | ColumnType::Blob)
    }
}

pub const CHARSET_BINARY: &str = "binary";
pub const COLLATION_BINARY: &str = "binary";
pub const CHARSET_UTF8MB4: &str = "utf8mb4";
pub const COLLATION_UTF8MB4_BIN: &str = "utf8mb4_bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    pub tp: ColumnType,
    pub unsigned: bool,
    pub charset: String,
    pub collation: String,
    /// Declared display/storage length, `None` when unspecified.
    pub flen: Option<u32>,
}

impl FieldType {
    pub fn new(tp: ColumnType) -> Self {
        let (charset, collation) = if tp.is_string() {
            (CHARSET_UTF8MB4, COLLATION_UTF8MB4_BIN)
        } else {
            (CHARSET_BINARY, COLLATION_BINARY)
        };
        Self {
            tp,
            unsigned: false,
            charset: charset.to_string(),
            collation: collation.to_string(),
            flen: None,
        }
    }

    pub fn bigint() -> Self {
        Self::new(ColumnType::LongLong)
    }

    pub fn int() -> Self {
        Self::new(ColumnType::Long)
    }

    pub fn varchar(len: u32) -> Self {
        Self::new(ColumnType::Varchar).with_flen(len)
    }

    pub fn with_unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn with_flen(mut self, flen: u32) -> Self {
        self.flen = Some(flen);
        self
    }

    pub fn with_charset(mut self, charset: &str, collation: &str) -> Self {
        self.charset = charset.to_string();
        self.collation = collation.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedColumn {
    pub expr: String,
    pub stored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: i64,
    pub name: String,
    pub offset: usize,
    pub field_type: FieldType,
    #[serde(default)]
    pub generated: Option<GeneratedColumn>,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub primary_key: bool,
    pub state: SchemaState,
}

impl ColumnInfo {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            offset: 0,
            field_type,
            generated: None,
            not_null: false,
            primary_key: false,
            state: SchemaState::Public,
        }
    }

    pub fn generated(mut self, expr: &str, stored: bool) -> Self {
        self.generated = Some(GeneratedColumn {
            expr: expr.to_string(),
            stored,
        });
        self
    }

    pub fn is_virtual_generated(&self) -> bool {
        self.generated.as_ref().is_some_and(|gen| !gen.stored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    pub offset: usize,
    /// Prefix length; `None` means the whole column is indexed.
    #[serde(default)]
    pub length: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: i64,
    pub name: String,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
    pub primary: bool,
    pub state: SchemaState,
}

impl IndexInfo {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|col| IndexColumn {
                    name: col.to_string(),
                    offset: 0,
                    length: None,
                })
                .collect(),
            unique: false,
            primary: false,
            state: SchemaState::Public,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_prefix_length(mut self, column: &str, length: u32) -> Self {
        for col in &mut self.columns {
            if col.name.eq_ignore_ascii_case(column) {
                col.length = Some(length);
            }
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceOption {
    Restrict,
    Cascade,
    SetNull,
    #[default]
    NoAction,
    SetDefault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub id: i64,
    pub name: String,
    pub ref_schema: String,
    pub ref_table: String,
    pub ref_cols: Vec<String>,
    pub cols: Vec<String>,
    #[serde(default)]
    pub on_delete: ReferenceOption,
    #[serde(default)]
    pub on_update: ReferenceOption,
    pub state: SchemaState,
    /// Constraints from before enforcement support carry version 0 and are ignored.
    #[serde(default)]
    pub version: u32,
}

impl ForeignKeyInfo {
    pub const ENFORCED_VERSION: u32 = 1;

    pub fn new(name: &str, cols: &[&str], ref_schema: &str, ref_table: &str, ref_cols: &[&str]) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            ref_schema: ref_schema.to_string(),
            ref_table: ref_table.to_string(),
            ref_cols: ref_cols.iter().map(|c| c.to_string()).collect(),
            cols: cols.iter().map(|c| c.to_string()).collect(),
            on_delete: ReferenceOption::NoAction,
            on_update: ReferenceOption::NoAction,
            state: SchemaState::None,
            version: Self::ENFORCED_VERSION,
        }
    }

    pub fn is_enforced(&self) -> bool {
        self.version >= Self::ENFORCED_VERSION
    }

    /// Whether `self` describes the same logical constraint as `other`,
    /// ignoring id and state.
    pub fn same_definition(&self, other: &ForeignKeyInfo) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.ref_schema.eq_ignore_ascii_case(&other.ref_schema)
            && self.ref_table.eq_ignore_ascii_case(&other.ref_table)
            && names_equal(&self.cols, &other.cols)
            && names_equal(&self.ref_cols, &other.ref_cols)
    }

    /// Renders the constraint the way MySQL prints it in referential errors.
    pub fn describe(&self, schema: &str, table: &str) -> String {
        let cols = join_idents(&self.cols);
        let ref_cols = join_idents(&self.ref_cols);
        format!(
            "{}.{}, CONSTRAINT {} FOREIGN KEY ({cols}) REFERENCES {}.{} ({ref_cols})",
            quote_ident(schema),
            quote_ident(table),
            quote_ident(&self.name),
            quote_ident(&self.ref_schema),
            quote_ident(&self.ref_table),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TempTableType {
    #[default]
    None,
    Local,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlInfo {
    pub column_name: String,
    pub interval_expr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub expr: String,
    pub num: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub indices: Vec<IndexInfo>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyInfo>,
    #[serde(default)]
    pub max_column_id: i64,
    #[serde(default)]
    pub max_index_id: i64,
    #[serde(default)]
    pub max_foreign_key_id: i64,
    /// The single integer primary-key column doubles as the row handle.
    #[serde(default)]
    pub pk_is_handle: bool,
    #[serde(default)]
    pub temp_table: TempTableType,
    #[serde(default)]
    pub ttl: Option<TtlInfo>,
    #[serde(default)]
    pub partition: Option<PartitionInfo>,
    pub state: SchemaState,
    #[serde(default)]
    pub update_ts: u64,
}

impl TableInfo {
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            columns: Vec::new(),
            indices: Vec::new(),
            foreign_keys: Vec::new(),
            max_column_id: 0,
            max_index_id: 0,
            max_foreign_key_id: 0,
            pk_is_handle: false,
            temp_table: TempTableType::None,
            ttl: None,
            partition: None,
            state: SchemaState::None,
            update_ts: 0,
        }
    }

    pub fn with_column(mut self, mut column: ColumnInfo) -> Self {
        self.max_column_id += 1;
        column.id = self.max_column_id;
        column.offset = self.columns.len();
        self.columns.push(column);
        self
    }

    /// Marks `column` as the integer primary key used as row handle.
    pub fn with_handle_primary_key(mut self, column: &str) -> Self {
        for col in &mut self.columns {
            if col.name.eq_ignore_ascii_case(column) {
                col.primary_key = true;
                col.not_null = true;
                self.pk_is_handle = col.field_type.tp.is_integer();
            }
        }
        self
    }

    pub fn with_index(mut self, mut index: IndexInfo) -> Self {
        self.max_index_id += 1;
        index.id = self.max_index_id;
        for col in &mut index.columns {
            if let Some(info) = find_column(&self.columns, &col.name) {
                col.offset = info.offset;
            }
        }
        self.indices.push(index);
        self
    }

    /// Adds a constraint declared inline in `CREATE TABLE`.
    pub fn with_foreign_key(mut self, mut fk: ForeignKeyInfo) -> Self {
        fk.id = self.allocate_foreign_key_id();
        fk.state = SchemaState::Public;
        self.foreign_keys.push(fk);
        self
    }

    pub fn with_temp_table(mut self, temp: TempTableType) -> Self {
        self.temp_table = temp;
        self
    }

    pub fn with_ttl(mut self, column: &str, interval_expr: &str) -> Self {
        self.ttl = Some(TtlInfo {
            column_name: column.to_string(),
            interval_expr: interval_expr.to_string(),
        });
        self
    }

    pub fn with_partition(mut self, expr: &str, num: u32) -> Self {
        self.partition = Some(PartitionInfo {
            expr: expr.to_string(),
            num,
        });
        self
    }

    /// Bumps the per-table constraint counter and returns the new id.
    pub fn allocate_foreign_key_id(&mut self) -> i64 {
        self.max_foreign_key_id += 1;
        self.max_foreign_key_id
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnInfo> {
        find_column(&self.columns, name)
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexInfo> {
        self.indices
            .iter()
            .find(|idx| idx.name.eq_ignore_ascii_case(name))
    }

    pub fn find_foreign_key(&self, name: &str) -> Option<&ForeignKeyInfo> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.name.eq_ignore_ascii_case(name))
    }

    pub fn foreign_key_position(&self, name: &str) -> Option<usize> {
        self.foreign_keys
            .iter()
            .position(|fk| fk.name.eq_ignore_ascii_case(name))
    }

    pub fn pk_handle_column(&self) -> Option<&ColumnInfo> {
        if !self.pk_is_handle {
            return None;
        }
        self.columns.iter().find(|col| col.primary_key)
    }

    /// Whether `index` covers `cols` as a leading, full-length prefix.
    pub fn is_index_prefix_covered(&self, index: &IndexInfo, cols: &[String]) -> bool {
        if index.columns.len() < cols.len() {
            return false;
        }
        for (col, idx_col) in cols.iter().zip(&index.columns) {
            if !idx_col.name.eq_ignore_ascii_case(col) {
                return false;
            }
            let Some(info) = self.columns.get(idx_col.offset) else {
                return false;
            };
            if let (Some(prefix), Some(flen)) = (idx_col.length, info.field_type.flen) {
                if prefix < flen {
                    return false;
                }
            } else if idx_col.length.is_some() {
                return false;
            }
        }
        true
    }

    /// Name of an index able to serve lookups on `cols`, if any.
    ///
    /// A single-column integer primary key used as the row handle counts as
    /// the `PRIMARY` index.
    pub fn covering_index_name(&self, cols: &[String]) -> Option<String> {
        if let Some(index) = self
            .indices
            .iter()
            .filter(|index| index.state == SchemaState::Public)
            .find(|index| self.is_index_prefix_covered(index, cols))
        {
            return Some(index.name.clone());
        }
        if cols.len() == 1 {
            if let Some(pk) = self.pk_handle_column() {
                if pk.name.eq_ignore_ascii_case(&cols[0]) {
                    return Some("PRIMARY".to_string());
                }
            }
        }
        None
    }

    /// Re-numbers column and index offsets after a column was removed.
    pub fn reindex_offsets(&mut self) {
        for (offset, col) in self.columns.iter_mut().enumerate() {
            col.offset = offset;
        }
        let columns = self.columns.clone();
        for index in &mut self.indices {
            for col in &mut index.columns {
                if let Some(info) = find_column(&columns, &col.name) {
                    col.offset = info.offset;
                }
            }
        }
    }
}

/// Lightweight `(id, name)` pair listed per schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleTableInfo {
    pub id: i64,
    pub name: String,
}

/// A constraint of some child table pointing at a given parent table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferredForeignKey {
    /// Referenced columns in the parent table.
    pub cols: Vec<String>,
    pub child_schema: String,
    pub child_table: String,
    pub child_fk_name: String,
}

pub fn find_column<'a>(columns: &'a [ColumnInfo], name: &str) -> Option<&'a ColumnInfo> {
    columns.iter().find(|col| col.name.eq_ignore_ascii_case(name))
}

pub fn names_equal(left: &[String], right: &[String]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .all(|(l, r)| l.eq_ignore_ascii_case(r))
}

fn join_idents(names: &[String]) -> String {
    names
        .iter()
        .map(|name| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ")
}

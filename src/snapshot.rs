//! Global state snapshots.
//!
//! A [`Dump`] records the value of every named global together with the
//! symbol it belongs to. Restoring checks each record against the target
//! session's symbol table before any slot is written, so a dump only applies
//! to a session that compiled the same declarations in the same order.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lang::symbol::{Address, Kind, SymbolTable};
use crate::lang::value::{MapKey, Value, ValueError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("snapshot slot {index} out of range (session has {len} globals)")]
    OutOfRange { index: usize, len: usize },

    #[error("snapshot slot {index}: no global named {name} there")]
    NameMismatch { index: usize, name: String },

    #[error("snapshot {name}: kind {found} does not match {expected}")]
    KindMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("snapshot {name}: type {found} does not match {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("snapshot {name}: function values cannot be changed")]
    Immutable { name: String },

    #[error("snapshot {name}: cannot save a value of type {type_name}")]
    Unsupported { name: String, type_name: String },

    #[error("snapshot {name}: {message}")]
    Invalid { name: String, message: String },

    #[error("snapshot encoding: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpKind {
    Var,
    Func,
}

impl std::fmt::Display for DumpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DumpKind::Var => write!(f, "var"),
            DumpKind::Func => write!(f, "func"),
        }
    }
}

/// Serializable mirror of [`Value`]. Heap pointers refer to an entry of
/// [`Dump::cells`], so globals sharing a cell still share it after restore;
/// pointers to globals keep their slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DumpValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Slice(Vec<DumpValue>),
    Map(Vec<(DumpValue, DumpValue)>),
    Struct(Vec<DumpValue>),
    Cell(usize),
    Addr(usize),
    Func(usize),
}

#[derive(Debug, Error)]
enum RestoreError {
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("unknown heap cell {0}")]
    Cell(usize),
}

/// Heap cells seen while capturing, numbered by first appearance.
#[derive(Default)]
struct CellTable {
    ids: HashMap<*const RefCell<Value>, usize>,
    cells: Vec<DumpValue>,
}

impl CellTable {
    /// `None` for values with no stable representation (host functions,
    /// iterators).
    fn capture(&mut self, value: &Value) -> Option<DumpValue> {
        Some(match value {
            Value::Nil => DumpValue::Nil,
            Value::Bool(b) => DumpValue::Bool(*b),
            Value::Int(n) => DumpValue::Int(*n),
            Value::Float(x) => DumpValue::Float(*x),
            Value::Str(s) => DumpValue::Str(s.clone()),
            Value::Slice(s) => DumpValue::Slice(
                s.items()
                    .iter()
                    .map(|v| self.capture(v))
                    .collect::<Option<_>>()?,
            ),
            Value::Map(m) => {
                let mut entries = Vec::new();
                for (k, v) in m.borrow().iter() {
                    entries.push((self.capture(&Value::from(k.clone()))?, self.capture(v)?));
                }
                DumpValue::Map(entries)
            }
            Value::Struct(fields) => {
                DumpValue::Struct(fields.iter().map(|v| self.capture(v)).collect::<Option<_>>()?)
            }
            Value::Heap(cell) => {
                let key = Rc::as_ptr(cell);
                if let Some(&id) = self.ids.get(&key) {
                    return Some(DumpValue::Cell(id));
                }
                let id = self.cells.len();
                self.ids.insert(key, id);
                // Reserved before recursing so a cycle resolves to this id.
                self.cells.push(DumpValue::Nil);
                let contents = self.capture(&cell.borrow())?;
                self.cells[id] = contents;
                DumpValue::Cell(id)
            }
            Value::Ref(addr) => DumpValue::Addr(*addr),
            Value::Func(offset) => DumpValue::Func(*offset),
            Value::Host(_) | Value::Iter(_) | Value::Type(_) => return None,
        })
    }
}

impl DumpValue {
    /// Captures a single value with its own cell numbering.
    pub fn capture(value: &Value) -> Option<DumpValue> {
        CellTable::default().capture(value)
    }

    fn restore(&self, cells: &[Rc<RefCell<Value>>]) -> Result<Value, RestoreError> {
        Ok(match self {
            DumpValue::Nil => Value::Nil,
            DumpValue::Bool(b) => Value::Bool(*b),
            DumpValue::Int(n) => Value::Int(*n),
            DumpValue::Float(x) => Value::Float(*x),
            DumpValue::Str(s) => Value::Str(s.clone()),
            DumpValue::Slice(items) => Value::slice_of(
                items
                    .iter()
                    .map(|v| v.restore(cells))
                    .collect::<Result<_, _>>()?,
            ),
            DumpValue::Map(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    map.insert(MapKey::try_from(&k.restore(cells)?)?, v.restore(cells)?);
                }
                Value::map_of(map)
            }
            DumpValue::Struct(fields) => Value::Struct(
                fields
                    .iter()
                    .map(|v| v.restore(cells))
                    .collect::<Result<_, _>>()?,
            ),
            DumpValue::Cell(id) => Value::Heap(Rc::clone(cells.get(*id).ok_or(RestoreError::Cell(*id))?)),
            DumpValue::Addr(addr) => Value::Ref(*addr),
            DumpValue::Func(offset) => Value::Func(*offset),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpRecord {
    pub index: usize,
    pub name: String,
    pub kind: DumpKind,
    pub type_name: String,
    pub value: DumpValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dump {
    pub records: Vec<DumpRecord>,
    /// Contents of the heap cells the records point to.
    pub cells: Vec<DumpValue>,
}

impl Dump {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        postcard::to_allocvec(self).map_err(|e| SnapshotError::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Dump, SnapshotError> {
        postcard::from_bytes(bytes).map_err(|e| SnapshotError::Codec(e.to_string()))
    }
}

fn dump_kind(kind: Kind) -> Option<DumpKind> {
    match kind {
        Kind::Var => Some(DumpKind::Var),
        Kind::Func => Some(DumpKind::Func),
        _ => None,
    }
}

/// Records for every global variable and compiled function, in slot order.
pub fn dump(symbols: &SymbolTable, globals: &[Value]) -> Result<Dump, SnapshotError> {
    let mut globals_by_slot: Vec<_> = symbols
        .iter()
        .filter_map(|(name, symbol)| match (dump_kind(symbol.kind), symbol.addr) {
            (Some(kind), Address::Global(index)) => Some((index, name, kind, symbol)),
            _ => None,
        })
        .collect();
    // Slot order keeps cell numbering stable across dumps of the same state.
    globals_by_slot.sort_by_key(|(index, ..)| *index);

    let mut table = CellTable::default();
    let mut records = Vec::new();
    for (index, name, kind, symbol) in globals_by_slot {
        let Some(current) = globals.get(index) else {
            continue;
        };
        let value = table.capture(current).ok_or_else(|| SnapshotError::Unsupported {
            name: name.clone(),
            type_name: symbol.ty.to_string(),
        })?;
        records.push(DumpRecord {
            index,
            name: name.clone(),
            kind,
            type_name: symbol.ty.to_string(),
            value,
        });
    }
    Ok(Dump {
        records,
        cells: table.cells,
    })
}

/// Checks every record against the target symbols and returns the slot
/// writes to perform. Nothing is written when any record fails.
pub fn restore(symbols: &SymbolTable, globals: &[Value], dump: &Dump) -> Result<Vec<(usize, Value)>, SnapshotError> {
    let cells: Vec<_> = dump.cells.iter().map(|_| Rc::new(RefCell::new(Value::Nil))).collect();
    for (id, contents) in dump.cells.iter().enumerate() {
        let value = contents.restore(&cells).map_err(|e| SnapshotError::Invalid {
            name: format!("heap cell {}", id),
            message: e.to_string(),
        })?;
        *cells[id].borrow_mut() = value;
    }

    let mut writes = Vec::with_capacity(dump.records.len());
    for record in &dump.records {
        let Some(current) = globals.get(record.index) else {
            return Err(SnapshotError::OutOfRange {
                index: record.index,
                len: globals.len(),
            });
        };
        let symbol = symbols
            .lookup(&record.name)
            .filter(|s| s.addr == Address::Global(record.index))
            .ok_or_else(|| SnapshotError::NameMismatch {
                index: record.index,
                name: record.name.clone(),
            })?;

        let kind = dump_kind(symbol.kind);
        if kind != Some(record.kind) {
            return Err(SnapshotError::KindMismatch {
                name: record.name.clone(),
                expected: kind.map(|k| k.to_string()).unwrap_or_else(|| "constant".into()),
                found: record.kind.to_string(),
            });
        }
        let type_name = symbol.ty.to_string();
        if type_name != record.type_name {
            return Err(SnapshotError::TypeMismatch {
                name: record.name.clone(),
                expected: type_name,
                found: record.type_name.clone(),
            });
        }
        if record.kind == DumpKind::Func {
            if DumpValue::capture(current).as_ref() != Some(&record.value) {
                return Err(SnapshotError::Immutable {
                    name: record.name.clone(),
                });
            }
            continue;
        }

        let value = record.value.restore(&cells).map_err(|e| SnapshotError::Invalid {
            name: record.name.clone(),
            message: e.to_string(),
        })?;
        writes.push((record.index, value));
    }
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::symbol::Symbol;
    use crate::lang::types::Type;

    fn table() -> SymbolTable {
        let mut symbols = SymbolTable::new();
        symbols.add("main/a", Symbol::new(Kind::Var, Address::Global(0), Type::Int));
        symbols.add(
            "main/f",
            Symbol::new(Kind::Func, Address::Global(1), Type::func(vec![], vec![]))
                .with_value(Value::Func(4)),
        );
        symbols.add("main/c", Symbol::new(Kind::Const, Address::Unresolved, Type::Int));
        symbols
    }

    #[test]
    fn test_dump_lists_globals_in_slot_order() {
        let dump = dump(&table(), &[Value::Int(3), Value::Func(4)]).unwrap();
        let names: Vec<_> = dump.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["main/a", "main/f"]);
        assert_eq!(dump.records[0].value, DumpValue::Int(3));
        assert_eq!(dump.records[1].kind, DumpKind::Func);
    }

    #[test]
    fn test_postcard_encoding() {
        let mut m = BTreeMap::new();
        m.insert(MapKey::Str("k".into()), Value::slice_of(vec![Value::Float(1.5)]));
        let value = DumpValue::capture(&Value::map_of(m)).unwrap();
        let dump = Dump {
            records: vec![DumpRecord {
                index: 0,
                name: "main/m".into(),
                kind: DumpKind::Var,
                type_name: "map[string][]float64".into(),
                value,
            }],
            cells: vec![],
        };
        let bytes = dump.to_bytes().unwrap();
        assert_eq!(Dump::from_bytes(&bytes), Ok(dump));
        assert!(matches!(Dump::from_bytes(&[0xff, 0xff]), Err(SnapshotError::Codec(_))));
    }

    #[test]
    fn test_restore_validates_before_writing() {
        let symbols = table();
        let globals = [Value::Int(0), Value::Func(4)];
        let mut dump = dump(&symbols, &[Value::Int(9), Value::Func(4)]).unwrap();
        assert_eq!(restore(&symbols, &globals, &dump), Ok(vec![(0, Value::Int(9))]));

        dump.records[0].type_name = "string".into();
        assert!(matches!(
            restore(&symbols, &globals, &dump),
            Err(SnapshotError::TypeMismatch { .. })
        ));

        dump.records[0].type_name = "int".into();
        dump.records[1].value = DumpValue::Func(8);
        assert_eq!(
            restore(&symbols, &globals, &dump),
            Err(SnapshotError::Immutable { name: "main/f".into() })
        );

        dump.records[0].index = 5;
        assert!(matches!(
            restore(&symbols, &globals, &dump),
            Err(SnapshotError::OutOfRange { index: 5, len: 2 })
        ));
    }

    #[test]
    fn test_host_values_are_not_dumpable() {
        let iter = Value::Iter(Box::new(crate::lang::value::RangeIter::Count { n: 1, pos: 0 }));
        assert_eq!(DumpValue::capture(&iter), None);
    }

    #[test]
    fn test_shared_cells_stay_shared() {
        let mut symbols = SymbolTable::new();
        let ptr = Type::ptr_to(Type::Int);
        symbols.add("main/p", Symbol::new(Kind::Var, Address::Global(0), ptr.clone()));
        symbols.add("main/q", Symbol::new(Kind::Var, Address::Global(1), ptr));
        let cell = Rc::new(RefCell::new(Value::Int(5)));
        let globals = [Value::Heap(Rc::clone(&cell)), Value::Heap(cell)];

        let dump = dump(&symbols, &globals).unwrap();
        assert_eq!(dump.cells, vec![DumpValue::Int(5)]);
        assert_eq!(dump.records[0].value, DumpValue::Cell(0));
        assert_eq!(dump.records[1].value, DumpValue::Cell(0));

        let writes = restore(&symbols, &[Value::Nil, Value::Nil], &dump).unwrap();
        let (Value::Heap(p), Value::Heap(q)) = (&writes[0].1, &writes[1].1) else {
            panic!("expected heap pointers, got {:?}", writes)
        };
        assert!(Rc::ptr_eq(p, q));
        *p.borrow_mut() = Value::Int(7);
        assert_eq!(*q.borrow(), Value::Int(7));
    }

    #[test]
    fn test_cyclic_cells() {
        let mut symbols = SymbolTable::new();
        symbols.add("main/n", Symbol::new(Kind::Var, Address::Global(0), Type::Any));
        let cell = Rc::new(RefCell::new(Value::Nil));
        *cell.borrow_mut() = Value::Struct(vec![Value::Int(1), Value::Heap(Rc::clone(&cell))]);

        let dump = dump(&symbols, &[Value::Heap(Rc::clone(&cell))]).unwrap();
        assert_eq!(
            dump.cells,
            vec![DumpValue::Struct(vec![DumpValue::Int(1), DumpValue::Cell(0)])]
        );
        let writes = restore(&symbols, &[Value::Nil], &dump).unwrap();
        let Value::Heap(restored) = &writes[0].1 else {
            panic!("expected a heap pointer")
        };
        let linked = match &*restored.borrow() {
            Value::Struct(fields) => matches!(&fields[1], Value::Heap(next) if Rc::ptr_eq(next, restored)),
            _ => false,
        };
        assert!(linked);

        *restored.borrow_mut() = Value::Nil;
        *cell.borrow_mut() = Value::Nil;
    }

    #[test]
    fn test_unknown_cell_is_rejected() {
        let mut symbols = SymbolTable::new();
        symbols.add("main/p", Symbol::new(Kind::Var, Address::Global(0), Type::ptr_to(Type::Int)));
        let dump = Dump {
            records: vec![DumpRecord {
                index: 0,
                name: "main/p".into(),
                kind: DumpKind::Var,
                type_name: "*int".into(),
                value: DumpValue::Cell(3),
            }],
            cells: vec![],
        };
        assert_eq!(
            restore(&symbols, &[Value::Nil], &dump),
            Err(SnapshotError::Invalid {
                name: "main/p".into(),
                message: "unknown heap cell 3".into(),
            })
        );
    }
}

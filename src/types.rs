//! Injected type-parser registry.
//!
//! The session never interprets row data itself; an application may register
//! parsers keyed by type oid and they are attached to every query result.
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use crate::postgres::{Oid, PgFormat};

/// A column parser: receives the raw column bytes and the wire format.
pub type TypeParser = Arc<dyn Fn(&[u8], PgFormat) -> Box<dyn Any + Send> + Send + Sync>;

/// Table of column parsers keyed by type oid.
#[derive(Default, Clone)]
pub struct Types {
    parsers: HashMap<Oid, TypeParser>,
}

impl Types {
    pub fn new() -> Types {
        Types::default()
    }

    pub fn register<F>(&mut self, oid: Oid, parser: F)
    where
        F: Fn(&[u8], PgFormat) -> Box<dyn Any + Send> + Send + Sync + 'static,
    {
        self.parsers.insert(oid, Arc::new(parser));
    }

    pub fn get(&self, oid: Oid) -> Option<&TypeParser> {
        self.parsers.get(&oid)
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

impl fmt::Debug for Types {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Types").field("len", &self.parsers.len()).finish()
    }
}

use std::collections::HashMap;

use super::dec::{Datum, Dec};
use super::enc::Enc;
use super::*;

/// Reserved annotation marker for symbol tables.
pub const SYM_SYMTAB: u32 = 1;
/// First id handed out to user symbols.
pub const FIRST_USER_SYM: u32 = 2;

/// Interned symbol table. Ids are dense and stable in interning order, so
/// a table can be encoded incrementally: a chunk either resets it (BVM +
/// full table) or appends the symbols added since the previous chunk.
#[derive(Clone, Debug, Default)]
pub struct Symtab {
    syms: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Symtab {
    pub fn new() -> Self {
        Symtab::default()
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    pub fn clear(&mut self) {
        self.syms.clear();
        self.ids.clear();
    }

    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = FIRST_USER_SYM + self.syms.len() as u32;
        self.syms.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        if id < FIRST_USER_SYM {
            return None;
        }
        self.syms.get((id - FIRST_USER_SYM) as usize).map(|s| s.as_str())
    }

    /// Encode a begin-version marker plus the full table.
    pub fn encode_full(&self, out: &mut Vec<u8>) {
        self.encode_full_upto(out, self.syms.len());
    }

    /// As `encode_full`, but only the first `upto` symbols; a chunk may
    /// exclude symbols interned by records that rolled into the next one.
    pub fn encode_full_upto(&self, out: &mut Vec<u8>, upto: usize) {
        out.extend_from_slice(&BVM);
        self.encode_annotation(out, 0, upto);
    }

    /// Encode a continuation annotation carrying the symbols interned at
    /// or after index `from` (an empty list reuses the table unchanged).
    pub fn encode_resume(&self, out: &mut Vec<u8>, from: usize) {
        self.encode_annotation(out, from, self.syms.len());
    }

    pub fn encode_resume_upto(&self, out: &mut Vec<u8>, from: usize, upto: usize) {
        self.encode_annotation(out, from, upto);
    }

    fn encode_annotation(&self, out: &mut Vec<u8>, from: usize, upto: usize) {
        let upto = upto.min(self.syms.len());
        let mut e = Enc::new();
        e.begin_annotation(SYM_SYMTAB);
        e.begin_list();
        for s in &self.syms[from.min(upto)..upto] {
            e.string(s);
        }
        e.end();
        e.end();
        out.extend_from_slice(e.bytes());
    }

    /// Consume a chunk header from `dec`: an optional BVM (which resets
    /// the table) followed by an optional symbol-table annotation. Errors
    /// if the stream starts with neither.
    pub fn read_block_header(&mut self, dec: &mut Dec<'_>) -> Result<()> {
        let mut saw_header = false;
        if dec.at_bvm() {
            dec.skip_bvm()?;
            self.clear();
            saw_header = true;
        }
        if dec.peek().map(|d| d >> 4) == Some(TYPE_ANNOTATION) {
            let save = dec.pos();
            match dec.value()? {
                Datum::Annotated(SYM_SYMTAB, inner) => {
                    for item in inner.as_list()? {
                        self.intern(item.as_str()?);
                    }
                    saw_header = true;
                }
                _ => {
                    return Err(Error::corrupt(format!(
                        "unexpected annotation at offset {save}"
                    )));
                }
            }
        }
        if !saw_header {
            return Err(Error::corrupt(
                "chunk must begin with a version marker or symbol table",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable() {
        let mut st = Symtab::new();
        let a = st.intern("alpha");
        let b = st.intern("beta");
        assert_eq!(st.intern("alpha"), a);
        assert_eq!(a, FIRST_USER_SYM);
        assert_eq!(b, FIRST_USER_SYM + 1);
        assert_eq!(st.name(a), Some("alpha"));
        assert_eq!(st.name(0), None);
    }

    #[test]
    fn full_then_resume_roundtrip() {
        let mut st = Symtab::new();
        st.intern("x");
        st.intern("y");
        let mut chunk0 = Vec::new();
        st.encode_full(&mut chunk0);

        let frozen = st.len();
        st.intern("z");
        let mut chunk1 = Vec::new();
        st.encode_resume(&mut chunk1, frozen);

        let mut got = Symtab::new();
        got.intern("stale"); // replaced by the BVM reset
        let mut d0 = Dec::new(&chunk0);
        got.read_block_header(&mut d0).unwrap();
        assert_eq!(got.lookup("x"), st.lookup("x"));
        assert_eq!(got.len(), 2);

        let mut d1 = Dec::new(&chunk1);
        got.read_block_header(&mut d1).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got.lookup("z"), st.lookup("z"));
    }

    #[test]
    fn missing_header_is_rejected() {
        let mut e = Enc::new();
        e.uint(1);
        let mut st = Symtab::new();
        let mut d = Dec::new(e.bytes());
        assert!(st.read_block_header(&mut d).is_err());
    }
}

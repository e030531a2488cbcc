use super::*;

/// Append-only SDR encoder. Containers (structs, lists, annotations) are
/// opened with `begin_*` and closed with `end`; the descriptor and length
/// are inserted when the container closes.
#[derive(Default)]
pub struct Enc {
    buf: Vec<u8>,
    open: Vec<(u8, usize)>,
}

impl Enc {
    pub fn new() -> Self {
        Enc::default()
    }

    pub fn from_buf(buf: Vec<u8>) -> Self {
        Enc { buf, open: Vec::new() }
    }

    pub fn bytes(&self) -> &[u8] {
        debug_assert!(self.open.is_empty(), "unclosed container");
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.open.clear();
    }

    pub fn into_inner(self) -> Vec<u8> {
        debug_assert!(self.open.is_empty(), "unclosed container");
        self.buf
    }

    fn tag(&mut self, ty: u8, len: usize) {
        if len < LEN_VAR as usize {
            self.buf.push((ty << 4) | len as u8);
        } else {
            self.buf.push((ty << 4) | LEN_VAR);
            put_uvarint(&mut self.buf, len as u64);
        }
    }

    fn magnitude(&mut self, ty: u8, mag: u64) {
        let n = if mag == 0 { 0 } else { (8 - (mag.leading_zeros() / 8) as usize).max(1) };
        self.tag(ty, n);
        for i in (0..n).rev() {
            self.buf.push((mag >> (8 * i)) as u8);
        }
    }

    pub fn null(&mut self) {
        self.buf.push((TYPE_PAD << 4) | 0x0F);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push((TYPE_BOOL << 4) | v as u8);
    }

    pub fn uint(&mut self, v: u64) {
        self.magnitude(TYPE_UINT, v);
    }

    pub fn int(&mut self, v: i64) {
        if v >= 0 {
            self.magnitude(TYPE_UINT, v as u64);
        } else {
            self.magnitude(TYPE_NEGINT, v.unsigned_abs());
        }
    }

    pub fn float(&mut self, v: f64) {
        if v == 0.0 && v.is_sign_positive() {
            self.buf.push(TYPE_FLOAT << 4);
            return;
        }
        self.tag(TYPE_FLOAT, 8);
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    /// Microseconds since the Unix epoch; fixed 8-byte big-endian payload.
    pub fn timestamp(&mut self, micros: i64) {
        self.tag(TYPE_TIMESTAMP, 8);
        self.buf.extend_from_slice(&micros.to_be_bytes());
    }

    pub fn symbol(&mut self, id: u32) {
        self.magnitude(TYPE_SYMBOL, id as u64);
    }

    pub fn string(&mut self, s: &str) {
        self.tag(TYPE_STRING, s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn blob(&mut self, b: &[u8]) {
        self.tag(TYPE_BLOB, b.len());
        self.buf.extend_from_slice(b);
    }

    /// Copy an already-encoded value verbatim.
    pub fn raw(&mut self, encoded: &[u8]) {
        self.buf.extend_from_slice(encoded);
    }

    pub fn begin_struct(&mut self) {
        self.open.push((TYPE_STRUCT, self.buf.len()));
    }

    /// Write a field's symbol id; the field value must follow.
    pub fn field(&mut self, sym: u32) {
        put_uvarint(&mut self.buf, sym as u64);
    }

    pub fn begin_list(&mut self) {
        self.open.push((TYPE_LIST, self.buf.len()));
    }

    pub fn begin_annotation(&mut self, sym: u32) {
        self.open.push((TYPE_ANNOTATION, self.buf.len()));
        put_uvarint(&mut self.buf, sym as u64);
    }

    /// Close the innermost open container, back-patching its descriptor.
    pub fn end(&mut self) {
        let (ty, start) = self.open.pop().expect("end() without begin");
        let len = self.buf.len() - start;
        let mut head = Vec::with_capacity(6);
        if len < LEN_VAR as usize {
            head.push((ty << 4) | len as u8);
        } else {
            head.push((ty << 4) | LEN_VAR);
            put_uvarint(&mut head, len as u64);
        }
        self.buf.splice(start..start, head);
    }

    pub fn bvm(&mut self) {
        self.buf.extend_from_slice(&BVM);
    }

    pub fn pad(&mut self, n: usize) {
        put_pad(&mut self.buf, n);
    }

    pub fn datum(&mut self, v: &OwnedDatum, symtab: &mut super::sym::Symtab) {
        match v {
            OwnedDatum::Null => self.null(),
            OwnedDatum::Bool(b) => self.bool(*b),
            OwnedDatum::Int(i) => self.int(*i),
            OwnedDatum::Float(f) => self.float(*f),
            OwnedDatum::Timestamp(t) => self.timestamp(*t),
            OwnedDatum::String(s) => self.string(s),
            OwnedDatum::Blob(b) => self.blob(b),
            OwnedDatum::List(items) => {
                self.begin_list();
                for it in items {
                    self.datum(it, symtab);
                }
                self.end();
            }
            OwnedDatum::Struct(fields) => {
                self.begin_struct();
                for (name, val) in fields {
                    let sym = symtab.intern(name);
                    self.field(sym);
                    self.datum(val, symtab);
                }
                self.end();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_layout() {
        let mut e = Enc::new();
        e.uint(0);
        assert_eq!(e.bytes(), &[0x20]);
        e.clear();
        e.int(-1);
        assert_eq!(e.bytes(), &[0x31, 0x01]);
        e.clear();
        e.bool(true);
        assert_eq!(e.bytes(), &[0x11]);
        e.clear();
        e.string("hi");
        assert_eq!(e.bytes(), &[0x82, b'h', b'i']);
    }

    #[test]
    fn nested_backpatch() {
        let mut e = Enc::new();
        e.begin_list();
        e.uint(1);
        e.begin_list();
        e.uint(2);
        e.end();
        e.end();
        // outer: [0xB?, 0x21 0x01, 0xB2 0x21 0x02]
        assert_eq!(e.bytes(), &[0xB5, 0x21, 0x01, 0xB2, 0x21, 0x02]);
    }

    #[test]
    fn long_containers_get_varuint_lengths(){
        let mut e = Enc::new();
        e.begin_list();
        for _ in 0..40 {
            e.uint(7);
        }
        e.end();
        let b = e.bytes();
        assert_eq!(b[0], (TYPE_LIST << 4) | LEN_VAR);
        let mut pos = 1;
        assert_eq!(get_uvarint(b, &mut pos).unwrap(), 80);
        assert_eq!(b.len(), pos + 80);
    }
}

use super::*;

/// A borrowed view of one decoded SDR value.
#[derive(Clone, Debug, PartialEq)]
pub enum Datum<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(i64),
    Symbol(u32),
    String(&'a str),
    Blob(&'a [u8]),
    List(Vec<Datum<'a>>),
    Struct(Vec<(u32, Datum<'a>)>),
    Annotated(u32, Box<Datum<'a>>),
}

impl<'a> Datum<'a> {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Datum::Int(i) => Ok(*i),
            _ => Err(Error::corrupt("expected integer")),
        }
    }

    pub fn as_str(&self) -> Result<&'a str> {
        match self {
            Datum::String(s) => Ok(s),
            _ => Err(Error::corrupt("expected string")),
        }
    }

    pub fn as_blob(&self) -> Result<&'a [u8]> {
        match self {
            Datum::Blob(b) => Ok(b),
            _ => Err(Error::corrupt("expected blob")),
        }
    }

    pub fn as_list(&self) -> Result<&[Datum<'a>]> {
        match self {
            Datum::List(v) => Ok(v),
            _ => Err(Error::corrupt("expected list")),
        }
    }

    pub fn as_struct(&self) -> Result<&[(u32, Datum<'a>)]> {
        match self {
            Datum::Struct(v) => Ok(v),
            _ => Err(Error::corrupt("expected struct")),
        }
    }

    pub fn as_timestamp(&self) -> Result<i64> {
        match self {
            Datum::Timestamp(t) => Ok(*t),
            _ => Err(Error::corrupt("expected timestamp")),
        }
    }

    /// Resolve symbols through `symtab` and copy into an owned tree.
    pub fn to_owned(&self, symtab: &super::sym::Symtab) -> Result<OwnedDatum> {
        Ok(match self {
            Datum::Null => OwnedDatum::Null,
            Datum::Bool(b) => OwnedDatum::Bool(*b),
            Datum::Int(i) => OwnedDatum::Int(*i),
            Datum::Float(f) => OwnedDatum::Float(*f),
            Datum::Timestamp(t) => OwnedDatum::Timestamp(*t),
            Datum::Symbol(id) => OwnedDatum::String(
                symtab
                    .name(*id)
                    .ok_or_else(|| Error::corrupt("symbol id out of range"))?
                    .to_string(),
            ),
            Datum::String(s) => OwnedDatum::String((*s).to_string()),
            Datum::Blob(b) => OwnedDatum::Blob(b.to_vec()),
            Datum::List(items) => OwnedDatum::List(
                items
                    .iter()
                    .map(|d| d.to_owned(symtab))
                    .collect::<Result<_>>()?,
            ),
            Datum::Struct(fields) => OwnedDatum::Struct(
                fields
                    .iter()
                    .map(|(sym, d)| {
                        let name = symtab
                            .name(*sym)
                            .ok_or_else(|| Error::corrupt("field symbol out of range"))?;
                        Ok((name.to_string(), d.to_owned(symtab)?))
                    })
                    .collect::<Result<_>>()?,
            ),
            Datum::Annotated(_, inner) => Datum::to_owned(inner, symtab)?,
        })
    }
}

/// Bounds-checked cursor over an SDR buffer.
pub struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Dec { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::corrupt("truncated value"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_uvarint(&mut self) -> Result<u64> {
        super::get_uvarint(self.buf, &mut self.pos)
    }

    /// Read a descriptor byte; returns (type, content length, is_null).
    fn descriptor(&mut self) -> Result<(u8, usize, bool)> {
        let d = self.take(1)?[0];
        let ty = d >> 4;
        let low = d & 0x0F;
        if low == 0x0F {
            return Ok((ty, 0, true));
        }
        let len = if low == LEN_VAR {
            self.get_uvarint()? as usize
        } else {
            low as usize
        };
        Ok((ty, len, false))
    }

    /// True if the next bytes are a begin-version marker.
    pub fn at_bvm(&self) -> bool {
        self.rest().starts_with(&BVM)
    }

    pub fn skip_bvm(&mut self) -> Result<()> {
        if !self.at_bvm() {
            return Err(Error::corrupt("expected begin-version marker"));
        }
        self.pos += BVM.len();
        Ok(())
    }

    /// Skip any NOP padding; returns the number of bytes skipped.
    pub fn skip_pads(&mut self) -> usize {
        let start = self.pos;
        while let Some(d) = self.peek() {
            if d >> 4 != TYPE_PAD || d & 0x0F == 0x0F {
                break;
            }
            let save = self.pos;
            match self.descriptor() {
                Ok((_, len, _)) if self.remaining() >= len => {
                    self.pos += len;
                }
                _ => {
                    self.pos = save;
                    break;
                }
            }
        }
        self.pos - start
    }

    /// Skip one complete value (descriptor + content).
    pub fn skip_value(&mut self) -> Result<()> {
        if self.at_bvm() {
            return self.skip_bvm();
        }
        if self.peek().map(|d| d >> 4) == Some(TYPE_BOOL) {
            self.pos += 1;
            return Ok(());
        }
        let (_, len, _) = self.descriptor()?;
        self.take(len)?;
        Ok(())
    }

    fn magnitude(content: &[u8]) -> Result<u64> {
        if content.len() > 8 {
            return Err(Error::corrupt("integer too wide"));
        }
        let mut v: u64 = 0;
        for &b in content {
            v = (v << 8) | b as u64;
        }
        Ok(v)
    }

    /// Decode one value. The begin-version marker is not a value; callers
    /// handle stream structure through `at_bvm`/`skip_bvm` and the symbol
    /// table reader.
    pub fn value(&mut self) -> Result<Datum<'a>> {
        loop {
            let (ty, len, null) = self.descriptor()?;
            if null {
                return Ok(Datum::Null);
            }
            match ty {
                TYPE_PAD => {
                    self.take(len)?;
                    continue;
                }
                TYPE_BOOL => {
                    // the length nibble is the value itself; no content follows
                    return match len {
                        0 => Ok(Datum::Bool(false)),
                        1 => Ok(Datum::Bool(true)),
                        _ => Err(Error::corrupt("bad bool descriptor")),
                    };
                }
                TYPE_UINT => {
                    let mag = Self::magnitude(self.take(len)?)?;
                    if mag > i64::MAX as u64 {
                        return Err(Error::corrupt("integer overflow"));
                    }
                    return Ok(Datum::Int(mag as i64));
                }
                TYPE_NEGINT => {
                    let mag = Self::magnitude(self.take(len)?)?;
                    if mag > i64::MAX as u64 + 1 {
                        return Err(Error::corrupt("integer overflow"));
                    }
                    return Ok(Datum::Int((mag as i128).wrapping_neg() as i64));
                }
                TYPE_FLOAT => {
                    return match len {
                        0 => Ok(Datum::Float(0.0)),
                        8 => {
                            let raw = self.take(8)?;
                            Ok(Datum::Float(f64::from_bits(u64::from_be_bytes(
                                raw.try_into().unwrap(),
                            ))))
                        }
                        _ => Err(Error::corrupt("bad float length")),
                    };
                }
                TYPE_TIMESTAMP => {
                    if len != 8 {
                        return Err(Error::corrupt("bad timestamp length"));
                    }
                    let raw = self.take(8)?;
                    return Ok(Datum::Timestamp(i64::from_be_bytes(
                        raw.try_into().unwrap(),
                    )));
                }
                TYPE_SYMBOL => {
                    let mag = Self::magnitude(self.take(len)?)?;
                    if mag > u32::MAX as u64 {
                        return Err(Error::corrupt("symbol id overflow"));
                    }
                    return Ok(Datum::Symbol(mag as u32));
                }
                TYPE_STRING => {
                    let raw = self.take(len)?;
                    let s = std::str::from_utf8(raw)
                        .map_err(|_| Error::corrupt("invalid utf-8 in string"))?;
                    return Ok(Datum::String(s));
                }
                TYPE_BLOB => {
                    return Ok(Datum::Blob(self.take(len)?));
                }
                TYPE_LIST => {
                    let mut inner = Dec::new(self.take(len)?);
                    let mut items = Vec::new();
                    while !inner.done() {
                        inner.skip_pads();
                        if inner.done() {
                            break;
                        }
                        items.push(inner.value()?);
                    }
                    return Ok(Datum::List(items));
                }
                TYPE_STRUCT => {
                    let mut inner = Dec::new(self.take(len)?);
                    let mut fields = Vec::new();
                    while !inner.done() {
                        let sym = inner.get_uvarint()?;
                        if sym > u32::MAX as u64 {
                            return Err(Error::corrupt("field symbol overflow"));
                        }
                        fields.push((sym as u32, inner.value()?));
                    }
                    return Ok(Datum::Struct(fields));
                }
                TYPE_ANNOTATION => {
                    let mut inner = Dec::new(self.take(len)?);
                    let sym = inner.get_uvarint()?;
                    if sym > u32::MAX as u64 {
                        return Err(Error::corrupt("annotation symbol overflow"));
                    }
                    let val = inner.value()?;
                    return Ok(Datum::Annotated(sym as u32, Box::new(val)));
                }
                _ => return Err(Error::corrupt(format!("unknown type nibble {ty:#x}"))),
            }
        }
    }
}

/// Total encoded size of the value starting at `buf[0]`, including its
/// descriptor, without decoding the content.
pub fn value_size(buf: &[u8]) -> Result<usize> {
    if buf.starts_with(&BVM) {
        return Ok(BVM.len());
    }
    let mut pos = 0usize;
    let d = *buf.first().ok_or_else(|| Error::corrupt("empty value"))?;
    pos += 1;
    let low = d & 0x0F;
    if low == 0x0F || d >> 4 == TYPE_BOOL {
        return Ok(1);
    }
    let len = if low == LEN_VAR {
        get_uvarint(buf, &mut pos)? as usize
    } else {
        low as usize
    };
    if buf.len() < pos + len {
        return Err(Error::corrupt("truncated value"));
    }
    Ok(pos + len)
}

#[cfg(test)]
mod tests {
    use super::super::enc::Enc;
    use super::super::sym::Symtab;
    use super::*;

    #[test]
    fn roundtrip_scalars() {
        let mut e = Enc::new();
        e.int(12345);
        e.int(-98765);
        e.float(2.5);
        e.timestamp(1_700_000_000_000_000);
        e.string("hello");
        e.bool(false);
        e.null();
        let mut d = Dec::new(e.bytes());
        assert_eq!(d.value().unwrap(), Datum::Int(12345));
        assert_eq!(d.value().unwrap(), Datum::Int(-98765));
        assert_eq!(d.value().unwrap(), Datum::Float(2.5));
        assert_eq!(d.value().unwrap(), Datum::Timestamp(1_700_000_000_000_000));
        assert_eq!(d.value().unwrap(), Datum::String("hello"));
        assert_eq!(d.value().unwrap(), Datum::Bool(false));
        assert_eq!(d.value().unwrap(), Datum::Null);
        assert!(d.done());
    }

    #[test]
    fn roundtrip_owned_tree() {
        let mut st = Symtab::new();
        let rec = OwnedDatum::Struct(vec![
            ("name".to_string(), OwnedDatum::String("a".to_string())),
            (
                "xs".to_string(),
                OwnedDatum::List(vec![OwnedDatum::Int(1), OwnedDatum::Int(2)]),
            ),
        ]);
        let mut e = Enc::new();
        e.datum(&rec, &mut st);
        let mut d = Dec::new(e.bytes());
        let got = d.value().unwrap().to_owned(&st).unwrap();
        assert_eq!(got, rec);
    }

    #[test]
    fn pads_are_skipped() {
        let mut e = Enc::new();
        e.pad(3);
        e.uint(9);
        let mut d = Dec::new(e.bytes());
        assert_eq!(d.value().unwrap(), Datum::Int(9));
    }

    #[test]
    fn value_size_walks_stream() {
        let mut e = Enc::new();
        e.string("abcdefghij");
        e.begin_list();
        e.uint(1);
        e.end();
        let buf = e.bytes();
        let n0 = value_size(buf).unwrap();
        assert_eq!(n0, 11);
        let n1 = value_size(&buf[n0..]).unwrap();
        assert_eq!(n0 + n1, buf.len());
    }
}

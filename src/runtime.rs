use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::ffi::c_void;
use std::io::{self, BufRead, Write};

/// The host side of a run: where intrinsics write to and read from. Compiled code receives a
/// pointer to this, so it must stay put while a program built against it exists.
pub struct Runtime<'a> {
    out: Box<dyn Write + 'a>,
    input: Box<dyn BufRead + 'a>,
}

impl<'a> Runtime<'a> {
    pub fn new(out: impl Write + 'a, input: impl BufRead + 'a) -> Self {
        Runtime {
            out: Box::new(out),
            input: Box::new(input),
        }
    }

    /// Process stdout and stdin.
    pub fn stdio() -> Runtime<'static> {
        Runtime::new(io::stdout(), io::BufReader::new(io::stdin()))
    }

    /// Swap the output sink, returning the previous one.
    pub fn replace_output(&mut self, out: impl Write + 'a) -> Box<dyn Write + 'a> {
        std::mem::replace(&mut self.out, Box::new(out))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// The context pointer handed to intrinsics.
    pub(crate) fn as_context(&mut self) -> *mut c_void {
        self as *mut Runtime<'a> as *mut c_void
    }
}

/// A host function callable from compiled code through `use`.
#[derive(Debug)]
pub struct Intrinsic {
    pub name: &'static str,
    pub arity: usize,
    /// Entry point, `extern "C" fn(*mut c_void, f64...) -> f64`
    pub address: usize,
}

type Unary = extern "C" fn(*mut c_void, f64) -> f64;
type Nullary = extern "C" fn(*mut c_void) -> f64;

static INTRINSICS: Lazy<HashMap<&'static str, Intrinsic>> = Lazy::new(|| {
    let unary = |name, f: Unary| (name, Intrinsic { name, arity: 1, address: f as usize });
    let nullary = |name, f: Nullary| (name, Intrinsic { name, arity: 0, address: f as usize });

    vec![
        unary("printByte", print_byte),
        unary("printUnicode", print_unicode),
        unary("printDouble", print_double),
        nullary("getDouble", get_double),
    ]
    .into_iter()
    .collect()
});

/// Look up an intrinsic by the name a `use` declaration gives it.
pub fn intrinsic(name: &str) -> Option<&'static Intrinsic> {
    INTRINSICS.get(name)
}

/// Address of `extern "C" fn(f64, f64) -> f64` raising the first operand to the second.
pub fn power_helper() -> usize {
    power as extern "C" fn(f64, f64) -> f64 as usize
}

extern "C" fn power(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

/// # Safety
/// `ctx` must come from [Runtime::as_context] on a runtime that is still alive.
/// The sink and source lifetimes are erased; the reference must not outlive the intrinsic call.
unsafe fn context<'r>(ctx: *mut c_void) -> &'r mut Runtime<'static> {
    &mut *(ctx as *mut Runtime<'static>)
}

fn write_all(rt: &mut Runtime, bytes: &[u8]) -> bool {
    match rt.out.write_all(bytes) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("intrinsic output failed: {}", e);
            false
        }
    }
}

/// Writes one byte. -1 for a non-integer, -2 outside 0..=255.
extern "C" fn print_byte(ctx: *mut c_void, value: f64) -> f64 {
    let rt = unsafe { context(ctx) };
    if value.trunc() != value {
        return -1.0;
    }
    if !(0.0..=255.0).contains(&value) {
        return -2.0;
    }
    if write_all(rt, &[value as u8]) {
        0.0
    } else {
        f64::NAN
    }
}

/// Writes a code point as UTF-8 and returns its length, or writes U+FFFD and returns 0.
extern "C" fn print_unicode(ctx: *mut c_void, value: f64) -> f64 {
    let rt = unsafe { context(ctx) };
    let c = if value.trunc() == value && value >= 0.0 && value <= u32::MAX as f64 {
        char::from_u32(value as u32)
    } else {
        None
    };

    let mut buf = [0; 4];
    let (encoded, ret) = match c {
        Some(c) => {
            let s = c.encode_utf8(&mut buf);
            (s.as_bytes(), s.len() as f64)
        }
        None => (char::REPLACEMENT_CHARACTER.encode_utf8(&mut buf).as_bytes(), 0.0),
    };
    if write_all(rt, encoded) {
        ret
    } else {
        f64::NAN
    }
}

extern "C" fn print_double(ctx: *mut c_void, value: f64) -> f64 {
    let rt = unsafe { context(ctx) };
    if write_all(rt, value.to_string().as_bytes()) {
        0.0
    } else {
        f64::NAN
    }
}

/// Reads a line and parses it; NaN at end of input or on garbage.
extern "C" fn get_double(ctx: *mut c_void) -> f64 {
    let rt = unsafe { context(ctx) };
    let mut line = String::new();
    match rt.input.read_line(&mut line) {
        Ok(0) => f64::NAN,
        Ok(_) => line.trim().parse().unwrap_or(f64::NAN),
        Err(e) => {
            log::warn!("getDouble failed to read: {}", e);
            f64::NAN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, rt: &mut Runtime, value: f64) -> f64 {
        let f: Unary = unsafe { std::mem::transmute(intrinsic(name).unwrap().address) };
        f(rt.as_context(), value)
    }

    #[test]
    fn table_has_the_io_functions() {
        assert_eq!(intrinsic("printByte").unwrap().arity, 1);
        assert_eq!(intrinsic("getDouble").unwrap().arity, 0);
        assert!(intrinsic("printf").is_none());
    }

    #[test]
    fn print_byte_checks_its_argument() {
        let mut out = vec![];
        let mut rt = Runtime::new(&mut out, io::empty());
        assert_eq!(call("printByte", &mut rt, 72.0), 0.0);
        assert_eq!(call("printByte", &mut rt, 1.5), -1.0);
        assert_eq!(call("printByte", &mut rt, 256.0), -2.0);
        assert_eq!(call("printByte", &mut rt, -1.0), -2.0);
        drop(rt);
        assert_eq!(out, b"H");
    }

    #[test]
    fn print_unicode_encodes_or_replaces() {
        let mut out = vec![];
        let mut rt = Runtime::new(&mut out, io::empty());
        assert_eq!(call("printUnicode", &mut rt, 0x41 as f64), 1.0);
        assert_eq!(call("printUnicode", &mut rt, 0xE9 as f64), 2.0);
        assert_eq!(call("printUnicode", &mut rt, 0x20AC as f64), 3.0);
        assert_eq!(call("printUnicode", &mut rt, 0x1F600 as f64), 4.0);
        assert_eq!(call("printUnicode", &mut rt, 0x110000 as f64), 0.0);
        assert_eq!(call("printUnicode", &mut rt, 65.5), 0.0);
        drop(rt);
        assert_eq!(String::from_utf8(out).unwrap(), "Aé€😀\u{FFFD}\u{FFFD}");
    }

    #[test]
    fn print_double_and_get_double() {
        let mut out = vec![];
        let mut rt = Runtime::new(&mut out, "2.5\nnope\n".as_bytes());
        assert_eq!(call("printDouble", &mut rt, 3.0), 0.0);
        assert_eq!(call("printDouble", &mut rt, -0.25), 0.0);

        let get: Nullary = unsafe { std::mem::transmute(intrinsic("getDouble").unwrap().address) };
        assert_eq!(get(rt.as_context()), 2.5);
        assert!(get(rt.as_context()).is_nan());
        assert!(get(rt.as_context()).is_nan());
        drop(rt);
        assert_eq!(out, b"3-0.25");
    }

    #[test]
    fn replaced_output_gets_the_writes() {
        let mut first = vec![];
        let mut second = vec![];
        let mut rt = Runtime::new(&mut first, io::empty());
        rt.replace_output(&mut second);
        call("printByte", &mut rt, 33.0);
        drop(rt);
        assert!(first.is_empty());
        assert_eq!(second, b"!");
    }
}

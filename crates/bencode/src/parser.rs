use arrayvec::ArrayVec;

/// Default nesting limit. Real-world torrents nest 4-5 levels deep,
/// tracker responses less. Anything past this is hostile input.
pub const DEFAULT_MAX_DEPTH: usize = 24;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("malformed bencode at offset {offset}")]
    Malformed { offset: usize },

    #[error("bencode nested deeper than {max_depth} levels at offset {offset}")]
    TooDeep { offset: usize, max_depth: usize },

    #[error("parsing cancelled by handler at offset {offset}")]
    Cancelled { offset: usize },

    #[error("truncated bencode: input ended mid-value")]
    Truncated,
}

/// Byte span of the token currently being delivered, relative to the
/// start of the input buffer.
///
/// For containers, `dict_begin`/`list_begin` spans cover the opening
/// byte and the matching `*_end` spans cover the closing "e". Callers
/// that need the whole container (e.g. to hash the "info" dict) pair
/// the begin start with the end... end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Context {
    pub token_start: usize,
    pub token_end: usize,
    pub depth: usize,
}

impl Context {
    pub fn span(&self) -> std::ops::Range<usize> {
        self.token_start..self.token_end
    }
}

/// Push-style parse events. Every callback returns `true` to continue;
/// returning `false` aborts the parse with [`Error::Cancelled`].
///
/// String and key payloads are views into the input buffer; nothing is
/// copied by the parser itself.
pub trait Handler {
    fn int(&mut self, _value: i64, _ctx: &Context) -> bool {
        true
    }
    fn string(&mut self, _value: &[u8], _ctx: &Context) -> bool {
        true
    }
    fn key(&mut self, _key: &[u8], _ctx: &Context) -> bool {
        true
    }
    fn dict_begin(&mut self, _ctx: &Context) -> bool {
        true
    }
    fn dict_end(&mut self, _ctx: &Context) -> bool {
        true
    }
    fn list_begin(&mut self, _ctx: &Context) -> bool {
        true
    }
    fn list_end(&mut self, _ctx: &Context) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug)]
enum Frame {
    Dict { expecting_key: bool },
    List,
}

/// Tracks container nesting and whether the next string in a dict is a
/// key. Fixed capacity: pushing past `MAX_DEPTH` is an error, so the
/// parser's memory use is bounded no matter the input.
pub struct ParserStack<const MAX_DEPTH: usize = DEFAULT_MAX_DEPTH> {
    frames: ArrayVec<Frame, MAX_DEPTH>,
}

impl<const MAX_DEPTH: usize> Default for ParserStack<MAX_DEPTH> {
    fn default() -> Self {
        Self {
            frames: ArrayVec::new(),
        }
    }
}

impl<const MAX_DEPTH: usize> ParserStack<MAX_DEPTH> {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn expecting_key(&self) -> bool {
        matches!(
            self.frames.last(),
            Some(Frame::Dict {
                expecting_key: true
            })
        )
    }

    fn push(&mut self, frame: Frame, offset: usize) -> Result<(), Error> {
        self.frames.try_push(frame).map_err(|_| Error::TooDeep {
            offset,
            max_depth: MAX_DEPTH,
        })
    }

    fn pop(&mut self, offset: usize) -> Result<Frame, Error> {
        self.frames.pop().ok_or(Error::Malformed { offset })
    }

    // A value was completed at the current level. In a dict this flips
    // the key/value expectation.
    fn value_done(&mut self) {
        if let Some(Frame::Dict { expecting_key }) = self.frames.last_mut() {
            *expecting_key = !*expecting_key;
        }
    }
}

/// Parse a single bencoded value from the front of `buf`, pushing
/// events into `handler`. Returns the number of bytes consumed;
/// trailing bytes are left for the caller.
pub fn parse<H: Handler>(buf: &[u8], handler: &mut H) -> Result<usize, Error> {
    parse_with_stack::<H, DEFAULT_MAX_DEPTH>(buf, handler)
}

pub fn parse_with_stack<H: Handler, const MAX_DEPTH: usize>(
    buf: &[u8],
    handler: &mut H,
) -> Result<usize, Error> {
    let mut stack = ParserStack::<MAX_DEPTH>::default();
    let mut pos = 0usize;

    loop {
        let b = *buf.get(pos).ok_or(Error::Truncated)?;
        match b {
            b'i' => {
                if stack.expecting_key() {
                    return Err(Error::Malformed { offset: pos });
                }
                let rest = &buf[pos + 1..];
                let end = memchr::memchr(b'e', rest).ok_or(Error::Truncated)?;
                let digits = &rest[..end];
                let value: i64 = parse_int(digits).ok_or(Error::Malformed { offset: pos })?;
                let ctx = Context {
                    token_start: pos,
                    token_end: pos + 1 + end + 1,
                    depth: stack.depth(),
                };
                if !handler.int(value, &ctx) {
                    return Err(Error::Cancelled { offset: pos });
                }
                pos = ctx.token_end;
                stack.value_done();
            }
            b'd' | b'l' => {
                if stack.expecting_key() {
                    return Err(Error::Malformed { offset: pos });
                }
                let ctx = Context {
                    token_start: pos,
                    token_end: pos + 1,
                    depth: stack.depth(),
                };
                let ok = if b == b'd' {
                    stack.push(
                        Frame::Dict {
                            expecting_key: true,
                        },
                        pos,
                    )?;
                    handler.dict_begin(&ctx)
                } else {
                    stack.push(Frame::List, pos)?;
                    handler.list_begin(&ctx)
                };
                if !ok {
                    return Err(Error::Cancelled { offset: pos });
                }
                pos += 1;
            }
            b'e' => {
                let frame = stack.pop(pos)?;
                let ctx = Context {
                    token_start: pos,
                    token_end: pos + 1,
                    depth: stack.depth(),
                };
                let ok = match frame {
                    // "d...<key>e" with a dangling key is malformed.
                    Frame::Dict { expecting_key } => {
                        if !expecting_key {
                            return Err(Error::Malformed { offset: pos });
                        }
                        handler.dict_end(&ctx)
                    }
                    Frame::List => handler.list_end(&ctx),
                };
                if !ok {
                    return Err(Error::Cancelled { offset: pos });
                }
                pos += 1;
                stack.value_done();
            }
            b'0'..=b'9' => {
                let rest = &buf[pos..];
                let colon = memchr::memchr(b':', rest).ok_or(Error::Truncated)?;
                let len: usize =
                    atoi::atoi(&rest[..colon]).ok_or(Error::Malformed { offset: pos })?;
                let start = pos + colon + 1;
                let end = start.checked_add(len).ok_or(Error::Malformed { offset: pos })?;
                if end > buf.len() {
                    return Err(Error::Truncated);
                }
                let payload = &buf[start..end];
                let ctx = Context {
                    token_start: pos,
                    token_end: end,
                    depth: stack.depth(),
                };
                let ok = if stack.expecting_key() {
                    handler.key(payload, &ctx)
                } else {
                    handler.string(payload, &ctx)
                };
                if !ok {
                    return Err(Error::Cancelled { offset: pos });
                }
                pos = end;
                stack.value_done();
            }
            _ => return Err(Error::Malformed { offset: pos }),
        }

        if stack.is_empty() {
            return Ok(pos);
        }
    }
}

// atoi doesn't do signs on all integer widths the way bencode needs
// them ("i-3e" is valid, "i-0e" and "i--3e" are not).
fn parse_int(digits: &[u8]) -> Option<i64> {
    match digits {
        [] => None,
        [b'-', rest @ ..] => {
            if rest.is_empty() || rest[0] == b'0' {
                return None;
            }
            let v: i64 = atoi::atoi(rest)?;
            v.checked_neg()
        }
        _ => atoi::atoi(digits),
    }
}

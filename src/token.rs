/// Associates readiness events with the handle that produced them.
///
/// `Token` is a wrapper around `usize` and is used as an argument to
/// [`Reactor::attach`] and [`Proactor::attach`]. Whenever the engine harvests
/// an event for a handle, the event carries the token the handle was attached
/// with.
///
/// `Token(usize::MAX)` is reserved for the engine's internal wakeup handle
/// and is never handed out by `attach`.
///
/// [`Reactor::attach`]: crate::Reactor::attach
/// [`Proactor::attach`]: crate::Proactor::attach
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}

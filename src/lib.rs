//! Incremental m4 macro expansion.
//!
//! The engine consumes raw text in chunks, recognizes macro invocations,
//! expands them (rescanning expansion results for further macros) and
//! emits the transformed text, with out-of-order output buffering
//! ("diversions") and reconfigurable quoting.
//!
//! ```
//! use m4stream::Engine;
//!
//! let mut engine = Engine::new();
//! let mut out = engine
//!     .feed("define(`greet', `Hello $1!')greet(`world')\n")
//!     .unwrap();
//! out.extend(engine.finish().unwrap());
//! assert_eq!(out.concat(), "Hello world!\n");
//! ```
//!
//! Input may be split anywhere, even mid-name or mid-quote; the engine
//! suspends on ambiguity and resumes on the next chunk, so output never
//! depends on chunk boundaries. For a `std::io`-flavored surface, see
//! [`ExpandingReader`].

pub mod divert;
pub mod engine;
pub mod error;
pub mod macros;
pub mod stream;
pub mod template;
pub mod token;

pub use engine::{Engine, Options};
pub use error::{M4Error, Warning, WarningCode};
pub use macros::{MacroDef, MacroKind, MacroTable, NativeFn};
pub use stream::ExpandingReader;
pub use template::Template;
pub use token::{Scan, Token, Tokenizer};

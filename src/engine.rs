use std::mem;

use log::{debug, trace};

use crate::divert::Diversions;
use crate::error::{M4Error, Warning, WarningCode};
use crate::macros::{MacroDef, MacroKind, MacroTable};
use crate::token::{DEFAULT_LEFT_QUOTE, DEFAULT_RIGHT_QUOTE, Scan, Token, Tokenizer};

/// Embedding configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Maximum simultaneous call-stack depth; 0 means unlimited.
    pub nesting_limit: usize,
    /// When true, unsupported undivert targets are fatal instead of
    /// warned-and-ignored.
    pub extensions: bool,
}

/// A macro name just recognized, not yet known to take arguments. The
/// definition is captured here, so a redefinition that lands before the
/// call is classified does not affect it.
#[derive(Debug)]
struct Pending {
    name: String,
    def: MacroDef,
}

#[derive(Debug)]
struct CallFrame {
    def: MacroDef,
    /// `args[0]` is the macro name; the last element is the open slot.
    args: Vec<String>,
    paren_depth: usize,
}

impl CallFrame {
    fn push_text(&mut self, text: &str) {
        if let Some(arg) = self.args.last_mut() {
            arg.push_str(text);
        }
    }
}

/// Incremental m4 macro expander.
///
/// Input arrives in chunks through [`feed`]; each chunk is processed to
/// completion and yields zero or more output chunks. Macro expansions are
/// reinjected into the tokenizer and rescanned as if they were fresh
/// input, so recursion is a trampoline over the token stream rather than
/// call-stack descent. [`finish`] marks end of input, resolves a trailing
/// bare call and drains every diversion.
///
/// A fatal error poisons the engine: the failing call returns the error
/// and discards its partial output, and every later call accepts input
/// but produces nothing.
///
/// [`feed`]: Engine::feed
/// [`finish`]: Engine::finish
#[derive(Debug)]
pub struct Engine {
    tokenizer: Tokenizer,
    macros: MacroTable,
    diversions: Diversions,
    stack: Vec<CallFrame>,
    pending: Option<Pending>,
    dnl: bool,
    skip_ws: bool,
    poisoned: bool,
    warnings: Vec<Warning>,
    options: Options,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let mut engine = Self {
            tokenizer: Tokenizer::new(),
            macros: MacroTable::new(),
            diversions: Diversions::new(),
            stack: Vec::new(),
            pending: None,
            dnl: false,
            skip_ws: false,
            poisoned: false,
            warnings: Vec::new(),
            options,
        };
        engine.install_bootstrap();
        engine
    }

    /// Feed one input chunk and return the output chunks it produced.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<String>, M4Error> {
        if self.poisoned {
            debug!("poisoned engine ignoring {} bytes", chunk.len());
            return Ok(Vec::new());
        }
        self.tokenizer.feed(chunk);
        if let Err(err) = self.pump() {
            return Err(self.poison(err));
        }
        Ok(self.diversions.take_output())
    }

    /// Mark end of input: resolves a trailing bare call, rejects an
    /// unclosed argument list, then forces `divert(0)` and drains every
    /// remaining diversion.
    pub fn finish(&mut self) -> Result<Vec<String>, M4Error> {
        if self.poisoned {
            return Ok(Vec::new());
        }
        self.tokenizer.end();
        if let Err(err) = self.pump() {
            return Err(self.poison(err));
        }
        if let Some(frame) = self.stack.last() {
            let name = frame.args.first().cloned().unwrap_or_default();
            return Err(self.poison(M4Error::UnexpectedEof { name }));
        }
        self.diversions.divert(0);
        self.diversions.undivert_all();
        Ok(self.diversions.take_output())
    }

    /// Run source for its side effects (definitions, diversions),
    /// discarding whatever it expands to.
    pub fn load(&mut self, source: &str) -> Result<(), M4Error> {
        self.feed(source)?;
        self.diversions.discard_output();
        Ok(())
    }

    pub fn load_file(&mut self, path: &str) -> Result<(), M4Error> {
        let source = std::fs::read_to_string(path).map_err(|err| M4Error::Io {
            path: path.to_string(),
            source: err,
        })?;
        self.load(&source)
    }

    /// Define a template-backed macro. An empty name is a no-op.
    pub fn define(&mut self, name: &str, body: &str) -> Result<(), M4Error> {
        if name.is_empty() {
            return Ok(());
        }
        let def = MacroDef::template(body)?;
        debug!("define `{name}'");
        self.macros.define(name, def);
        Ok(())
    }

    /// Register a macro under full control of its flags, typically a
    /// native one built with [`MacroDef::native`].
    pub fn register(&mut self, name: &str, def: MacroDef) {
        self.macros.define(name, def);
    }

    pub fn divert(&mut self, ix: i64) {
        self.diversions.divert(ix);
    }

    pub fn divnum(&self) -> i64 {
        self.diversions.divnum()
    }

    /// Discard everything up to and including the next newline.
    pub fn dnl(&mut self) {
        self.dnl = true;
    }

    /// Drain diversions. Numeric targets drain and delete one diversion
    /// each; no targets drains all of them in ascending order, skipping
    /// the current one. Textual targets are an unimplemented extension.
    pub fn undivert(&mut self, targets: &[&str]) -> Result<(), M4Error> {
        let targets: Vec<&str> = targets
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if targets.is_empty() {
            self.diversions.undivert_all();
            return Ok(());
        }
        for target in targets {
            match target.parse::<i64>() {
                Ok(ix) => self.diversions.undivert_one(ix),
                Err(_) if self.options.extensions => {
                    return Err(M4Error::UnimplementedUndivert {
                        target: target.to_string(),
                    });
                }
                Err(_) => self.warn(WarningCode::UnsupportedUndivert, target),
            }
        }
        Ok(())
    }

    /// Reconfigure the quote pair. Absent or empty arguments fall back to
    /// the defaults; with only a left delimiter the conventional close
    /// delimiter is kept. Affects tokenization of subsequent input and
    /// `$@` wrapping, never already-tokenized text.
    pub fn change_quote(&mut self, left: Option<&str>, right: Option<&str>) {
        let left = left.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_LEFT_QUOTE);
        let right = right
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_RIGHT_QUOTE);
        self.tokenizer.set_quotes(left, right);
    }

    /// Drain collected out-of-band warnings.
    pub fn take_warnings(&mut self) -> Vec<Warning> {
        mem::take(&mut self.warnings)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn install_bootstrap(&mut self) {
        self.register(
            "define",
            MacroDef::native(2, |eng, args| {
                eng.define(arg(args, 1), arg(args, 2))?;
                Ok(String::new())
            })
            .inert(),
        );
        self.register(
            "divert",
            MacroDef::native(1, |eng, args| {
                let ix = arg(args, 1).trim().parse().unwrap_or(0);
                eng.divert(ix);
                Ok(String::new())
            }),
        );
        self.register(
            "undivert",
            MacroDef::native(0, |eng, args| {
                let targets: Vec<&str> = args
                    .get(1..)
                    .unwrap_or_default()
                    .iter()
                    .map(String::as_str)
                    .collect();
                eng.undivert(&targets)?;
                Ok(String::new())
            })
            .variadic(),
        );
        self.register(
            "divnum",
            MacroDef::native(0, |eng, _args| Ok(eng.divnum().to_string())),
        );
        self.register(
            "dnl",
            MacroDef::native(0, |eng, _args| {
                eng.dnl();
                Ok(String::new())
            }),
        );
        self.register(
            "changequote",
            MacroDef::native(2, |eng, args| {
                let left = args.get(1).map(String::as_str).filter(|s| !s.is_empty());
                let right = args.get(2).map(String::as_str).filter(|s| !s.is_empty());
                eng.change_quote(left, right);
                Ok(String::new())
            }),
        );
    }

    fn poison(&mut self, err: M4Error) -> M4Error {
        self.poisoned = true;
        self.diversions.discard_output();
        err
    }

    fn warn(&mut self, code: WarningCode, subject: &str) {
        let warning = Warning::new(code, subject);
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Pull tokens until the buffered input is exhausted or a pending
    /// call has to wait for the next chunk.
    fn pump(&mut self) -> Result<(), M4Error> {
        loop {
            self.resolve_pending()?;
            if self.pending.is_some() {
                return Ok(());
            }
            match self.tokenizer.next_token() {
                Scan::Ready(tok) => self.process_token(tok)?,
                Scan::NeedMoreInput | Scan::End => return Ok(()),
            }
        }
    }

    fn process_token(&mut self, tok: Token) -> Result<(), M4Error> {
        if self.dnl {
            if tok.is_newline() {
                self.dnl = false;
            }
            return Ok(());
        }
        if self.skip_ws {
            self.skip_ws = false;
            if tok.is_blank() {
                return Ok(());
            }
        }
        if let Token::Name(name) = &tok {
            if let Some(def) = self.macros.get(name) {
                self.pending = Some(Pending {
                    name: name.clone(),
                    def: def.clone(),
                });
                return Ok(());
            }
        }
        if self.stack.is_empty() {
            self.diversions.emit(tok.text());
            return Ok(());
        }
        self.literal_in_frame(tok)
    }

    /// Classify the pending name: `(` promotes it to a call frame,
    /// anything else (or end of input) resolves it as a zero-argument
    /// call. An empty buffer before end of input is the engine's sole
    /// suspension point: a bare name at the buffer edge must not be
    /// treated as a zero-argument call prematurely.
    fn resolve_pending(&mut self) -> Result<(), M4Error> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        match self.tokenizer.peek_char() {
            Scan::NeedMoreInput => {
                self.pending = Some(pending);
                Ok(())
            }
            Scan::Ready('(') => {
                let limit = self.options.nesting_limit;
                if limit > 0 && self.stack.len() >= limit {
                    return Err(M4Error::NestingLimit {
                        name: pending.name,
                        limit,
                    });
                }
                self.tokenizer.bump();
                self.stack.push(CallFrame {
                    def: pending.def,
                    args: vec![pending.name, String::new()],
                    paren_depth: 0,
                });
                self.skip_ws = true;
                Ok(())
            }
            Scan::Ready(_) | Scan::End => {
                let args = vec![pending.name];
                let expansion = self.invoke(&pending.def, &args)?;
                self.tokenizer.reinject(&expansion);
                Ok(())
            }
        }
    }

    fn literal_in_frame(&mut self, tok: Token) -> Result<(), M4Error> {
        let Some(frame) = self.stack.last_mut() else {
            return Ok(());
        };
        match tok.control_char() {
            // Unmatched `)` closes the innermost call, handled past the
            // match so the popped frame can be invoked.
            Some(')') if frame.paren_depth == 0 => {}
            Some(')') => {
                frame.paren_depth -= 1;
                frame.push_text(")");
                return Ok(());
            }
            Some('(') => {
                frame.paren_depth += 1;
                frame.push_text("(");
                return Ok(());
            }
            Some(',') if frame.paren_depth == 0 => {
                frame.args.push(String::new());
                self.skip_ws = true;
                return Ok(());
            }
            _ => {
                frame.push_text(tok.text());
                return Ok(());
            }
        }
        let Some(frame) = self.stack.pop() else {
            return Ok(());
        };
        let expansion = self.invoke(&frame.def, &frame.args)?;
        self.tokenizer.reinject(&expansion);
        Ok(())
    }

    fn invoke(&mut self, def: &MacroDef, args: &[String]) -> Result<String, M4Error> {
        let name = args.first().map(String::as_str).unwrap_or_default();
        trace!(
            "expanding `{name}' with {} argument(s)",
            args.len().saturating_sub(1)
        );
        if def.inert && args.len() <= 1 {
            let (left, right) = self.tokenizer.quotes();
            return Ok(format!("{left}{name}{right}"));
        }
        if !def.variadic && args.len().saturating_sub(1) > def.arity {
            self.warn(WarningCode::ExcessArguments, name);
        }
        match &def.kind {
            MacroKind::Template(template) => Ok(template.expand(args, self.tokenizer.quotes())),
            MacroKind::Native(f) => f(self, args),
        }
    }
}

fn arg(args: &[String], n: usize) -> &str {
    args.get(n).map(String::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(input: &str) -> String {
        expand_with(Engine::new(), input)
    }

    fn expand_with(mut engine: Engine, input: &str) -> String {
        let mut out = engine.feed(input).unwrap();
        out.extend(engine.finish().unwrap());
        out.concat()
    }

    #[test]
    fn test_plain_text_round_trip() {
        let input = "no macros here: 1 + 2, (parens) & punctuation!\n";
        assert_eq!(expand(input), input);
    }

    #[test]
    fn test_round_trip_is_chunk_boundary_independent() {
        let input = "plain text, `quoted span', trailing word\n";
        let whole = expand(input);
        for split in 0..=input.len() {
            let mut engine = Engine::new();
            let mut out = engine.feed(&input[..split]).unwrap();
            out.extend(engine.feed(&input[split..]).unwrap());
            out.extend(engine.finish().unwrap());
            assert_eq!(out.concat(), whole, "split at {split}");
        }
    }

    #[test]
    fn test_define_and_invoke() {
        assert_eq!(
            expand("define(`greet', `Hello $1!')greet(`world')"),
            "Hello world!"
        );
    }

    #[test]
    fn test_definition_matches_direct_substitution() {
        use crate::template::Template;

        let body = "$1 and $2 ($#)";
        let direct = Template::compile(body).unwrap().expand(
            &["m".to_string(), "a".to_string(), "b".to_string()],
            ("`", "'"),
        );
        let via_engine = expand("define(`m', `$1 and $2 ($#)')m(`a', `b')");
        assert_eq!(via_engine, direct);
    }

    #[test]
    fn test_quoted_comma_does_not_split_arguments() {
        assert_eq!(expand("define(`id', `$1')id(`a,b')"), "a,b");
    }

    #[test]
    fn test_quoted_paren_does_not_close_call() {
        assert_eq!(expand("define(`id', `$1')id(`a)b')"), "a)b");
    }

    #[test]
    fn test_nested_parens_in_argument() {
        assert_eq!(expand("define(`id', `$1')id((a))"), "(a)");
    }

    #[test]
    fn test_expansion_is_rescanned() {
        let input = "define(`inner', `INNER')define(`outer', `before inner after')outer";
        assert_eq!(expand(input), "before INNER after");
    }

    #[test]
    fn test_argument_macros_expand_during_collection() {
        let input = "define(`inner', `X')define(`wrap', `[$1]')wrap(inner)";
        assert_eq!(expand(input), "[X]");
    }

    #[test]
    fn test_quoting_delays_expansion() {
        let input = "define(`foo', `bar')`foo'";
        assert_eq!(expand(input), "foo");
    }

    #[test]
    fn test_dnl_scenario() {
        let input = "define(`foo',`Hello $1')dnl\nfoo(`world')\n";
        assert_eq!(expand(input), "Hello world\n");
    }

    #[test]
    fn test_divert_scenario() {
        let input = "divert(1)one\ndivert(0)two\nundivert(1)three\n";
        assert_eq!(expand(input), "two\none\nthree\n");
    }

    #[test]
    fn test_undivert_drains_ascending_and_deletes() {
        let input = "divert(1)a\ndivert(3)c\ndivert(2)b\nundivert\n";
        // Diversions 1 and 3 replay into the current diversion 2, which
        // the final flush then drains.
        assert_eq!(expand(input), "b\na\nc\n\n");
    }

    #[test]
    fn test_unflushed_diversions_drain_at_end() {
        assert_eq!(expand("divert(2)late\ndivert(0)early\n"), "early\nlate\n");
    }

    #[test]
    fn test_divnum_reports_current_index() {
        assert_eq!(expand("divnum divert(-1)divnum divert(0)divnum"), "0 0");
    }

    #[test]
    fn test_bare_inert_macro_expands_to_quoted_name() {
        assert_eq!(expand("define and more"), "define and more");
    }

    #[test]
    fn test_bare_dnl_is_not_inert() {
        assert_eq!(expand("dnl gone\nkept\n"), "kept\n");
    }

    #[test]
    fn test_nesting_limit() {
        let mut engine = Engine::with_options(Options {
            nesting_limit: 1,
            ..Options::default()
        });
        engine.define("wrap", "[$1]").unwrap();
        engine.define("inner", "X").unwrap();
        let err = engine.feed("wrap(inner(1))").unwrap_err();
        assert!(matches!(err, M4Error::NestingLimit { name, limit: 1 } if name == "inner"));
        assert!(engine.is_poisoned());
    }

    #[test]
    fn test_changequote_scenario() {
        assert_eq!(expand("changequote([,])[a,b]"), "a,b");
    }

    #[test]
    fn test_changequote_affects_argument_quoting() {
        let input = "changequote([,])define([x], [1,2])x";
        assert_eq!(expand(input), "1,2");
    }

    #[test]
    fn test_changequote_without_arguments_restores_defaults() {
        let input = "changequote([,])changequote`a,b'";
        assert_eq!(expand(input), "a,b");
    }

    #[test]
    fn test_quoted_star_protects_commas_through_recursion() {
        let input = "define(`first', `$1')define(`pass', `first($@)')pass(`a,b', c)";
        assert_eq!(expand(input), "a,b");
    }

    #[test]
    fn test_pending_call_waits_for_next_chunk() {
        let mut engine = Engine::new();
        engine.define("foo", "X").unwrap();
        assert!(engine.feed("foo").unwrap().is_empty());
        let mut out = engine.feed("!").unwrap();
        out.extend(engine.finish().unwrap());
        assert_eq!(out.concat(), "X!");
    }

    #[test]
    fn test_pending_call_resolves_at_end_of_input() {
        let mut engine = Engine::new();
        engine.define("foo", "X").unwrap();
        assert!(engine.feed("foo").unwrap().is_empty());
        assert_eq!(engine.finish().unwrap().concat(), "X");
    }

    #[test]
    fn test_call_split_across_chunks() {
        let mut engine = Engine::new();
        engine.define("greet", "Hello $1").unwrap();
        let mut out = Vec::new();
        for chunk in ["gre", "et(`wor", "ld')"] {
            out.extend(engine.feed(chunk).unwrap());
        }
        out.extend(engine.finish().unwrap());
        assert_eq!(out.concat(), "Hello world");
    }

    #[test]
    fn test_redefinition_is_not_retroactive() {
        let input = "define(`a',`old')a(define(`a',`new'))a";
        assert_eq!(expand(input), "oldnew");
    }

    #[test]
    fn test_define_with_empty_name_is_a_no_op() {
        assert_eq!(expand("define(`',`x')done"), "done");
    }

    #[test]
    fn test_define_without_body_expands_to_empty() {
        assert_eq!(expand("define(`m')m!"), "!");
    }

    #[test]
    fn test_leading_whitespace_after_comma_is_skipped() {
        assert_eq!(expand("define(`id', `$1')id( x)"), "x");
    }

    #[test]
    fn test_excess_arguments_warns_but_proceeds() {
        let mut engine = Engine::new();
        let mut out = engine.feed("divnum(ignored)").unwrap();
        out.extend(engine.finish().unwrap());
        assert_eq!(out.concat(), "0");

        let warnings = engine.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, WarningCode::ExcessArguments);
        assert_eq!(warnings[0].subject, "divnum");
    }

    #[test]
    fn test_template_macros_never_warn_on_extra_arguments() {
        let mut engine = Engine::new();
        engine.define("one", "$1").unwrap();
        let out = expand_with(engine, "one(a, b, c)");
        assert_eq!(out, "a");
    }

    #[test]
    fn test_textual_undivert_warns_without_extensions() {
        let mut engine = Engine::new();
        let mut out = engine.feed("undivert(`notes.txt')ok").unwrap();
        out.extend(engine.finish().unwrap());
        assert_eq!(out.concat(), "ok");

        let warnings = engine.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, WarningCode::UnsupportedUndivert);
        assert_eq!(warnings[0].subject, "notes.txt");
    }

    #[test]
    fn test_textual_undivert_is_fatal_with_extensions() {
        let mut engine = Engine::with_options(Options {
            extensions: true,
            ..Options::default()
        });
        let err = engine.feed("undivert(`notes.txt')").unwrap_err();
        assert!(
            matches!(err, M4Error::UnimplementedUndivert { target } if target == "notes.txt")
        );
    }

    #[test]
    fn test_repeated_undivert_target_is_a_no_op() {
        let input = "divert(1)once\ndivert(0)undivert(1, 1)";
        assert_eq!(expand(input), "once\n");
    }

    #[test]
    fn test_poisoned_engine_ignores_further_input() {
        let mut engine = Engine::with_options(Options {
            extensions: true,
            ..Options::default()
        });
        engine.feed("undivert(`nope')").unwrap_err();
        assert!(engine.is_poisoned());
        assert!(engine.feed("define(`x', `y')x").unwrap().is_empty());
        assert!(engine.finish().unwrap().is_empty());
    }

    #[test]
    fn test_unclosed_argument_list_is_fatal() {
        let mut engine = Engine::new();
        engine.feed("define(`x', `y'").unwrap();
        let err = engine.finish().unwrap_err();
        assert!(matches!(err, M4Error::UnexpectedEof { name } if name == "define"));
    }

    #[test]
    fn test_host_operations_mirror_macros() {
        let mut engine = Engine::new();
        engine.define("greet", "hi $1").unwrap();
        engine.divert(1);
        assert_eq!(engine.divnum(), 1);
        let mut out = engine.feed("greet(`you')").unwrap();
        engine.divert(0);
        engine.undivert(&[]).unwrap();
        out.extend(engine.finish().unwrap());
        assert_eq!(out.concat(), "hi you");
    }

    #[test]
    fn test_register_native_macro() {
        let mut engine = Engine::new();
        engine.register(
            "shout",
            MacroDef::native(1, |_eng, args| Ok(arg(args, 1).to_uppercase())),
        );
        assert_eq!(expand_with(engine, "shout(`quiet')"), "QUIET");
    }

    #[test]
    fn test_native_failure_poisons_engine() {
        let mut engine = Engine::new();
        engine.register(
            "boom",
            MacroDef::native(0, |_eng, _args| {
                Err(M4Error::InvalidBody("boom".to_string()))
            }),
        );
        engine.feed("boom(now)").unwrap_err();
        assert!(engine.is_poisoned());
    }

    #[test]
    fn test_load_keeps_definitions_and_discards_output() {
        let mut engine = Engine::new();
        engine.load("define(`foo', `bar')stray text\n").unwrap();
        assert_eq!(expand_with(engine, "foo"), "bar");
    }

    #[test]
    fn test_undefined_names_pass_through() {
        assert_eq!(expand("nobody(home, today)"), "nobody(home, today)");
    }
}

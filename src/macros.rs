use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::M4Error;
use crate::template::Template;

/// A host-registered macro implementation. `args[0]` is the macro's own
/// name; failure poisons the engine that invoked it.
pub type NativeFn = dyn Fn(&mut Engine, &[String]) -> Result<String, M4Error>;

#[derive(Clone)]
pub enum MacroKind {
    /// Body string compiled through the substitution engine.
    Template(Template),
    /// Host-registered function.
    Native(Rc<NativeFn>),
}

impl fmt::Debug for MacroKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacroKind::Template(t) => f.debug_tuple("Template").field(t).finish(),
            MacroKind::Native(_) => f.write_str("Native(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub(crate) kind: MacroKind,
    /// Declared argument count; exceeding it on a non-variadic macro
    /// raises a warning.
    pub(crate) arity: usize,
    /// Invoked bare (no parenthesized arguments), the expansion is the
    /// macro name re-wrapped in the current quote pair instead of the
    /// body.
    pub(crate) inert: bool,
    /// Suppresses the excess-argument warning.
    pub(crate) variadic: bool,
}

impl MacroDef {
    /// Compile a plain body; template macros accept any argument count.
    pub fn template(body: &str) -> Result<Self, M4Error> {
        Ok(Self {
            kind: MacroKind::Template(Template::compile(body)?),
            arity: 0,
            inert: false,
            variadic: true,
        })
    }

    pub fn native<F>(arity: usize, f: F) -> Self
    where
        F: Fn(&mut Engine, &[String]) -> Result<String, M4Error> + 'static,
    {
        Self {
            kind: MacroKind::Native(Rc::new(f)),
            arity,
            inert: false,
            variadic: false,
        }
    }

    pub fn inert(mut self) -> Self {
        self.inert = true;
        self
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }
}

/// Registry of macro definitions. Redefinition overwrites and takes
/// effect for calls recognized afterwards.
#[derive(Debug, Default)]
pub struct MacroTable(HashMap<String, MacroDef>);

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: &str, def: MacroDef) {
        self.0.insert(name.to_string(), def);
    }

    pub fn get(&self, name: &str) -> Option<&MacroDef> {
        self.0.get(name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}

use pest::Parser;
use pest_derive::Parser;

use crate::error::M4Error;

#[derive(Parser)]
#[grammar = "template.pest"]
struct TemplateParser;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Text(String),
    /// `$N`; `$0` is the macro's own name.
    Arg(usize),
    /// `$#`: argument count excluding the name.
    Count,
    /// `$*`: args joined by `,`.
    Star,
    /// `$@`: args wrapped in the current quote pair, joined by `,`.
    QuotedStar,
}

/// A macro body compiled once at definition time. Expansion is a single
/// left-to-right pass; recursion happens later when the *output* is
/// rescanned, never by re-substituting the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segs: Vec<Seg>,
}

impl Template {
    pub fn compile(body: &str) -> Result<Self, M4Error> {
        let mut pairs = TemplateParser::parse(Rule::template, body)
            .map_err(|e| M4Error::InvalidBody(e.to_string()))?;
        let Some(template) = pairs.next() else {
            return Ok(Self { segs: Vec::new() });
        };

        let segs = template
            .into_inner()
            .filter_map(|p| match p.as_rule() {
                Rule::positional => {
                    // Out-of-range references expand to nothing.
                    let n = p.as_str()[1..].parse().unwrap_or(usize::MAX);
                    Some(Seg::Arg(n))
                }
                Rule::count => Some(Seg::Count),
                Rule::star => Some(Seg::Star),
                Rule::at => Some(Seg::QuotedStar),
                Rule::text => Some(Seg::Text(p.as_str().to_string())),
                _ => None,
            })
            .collect();

        Ok(Self { segs })
    }

    /// Substitute actual call arguments. `args[0]` is the macro name.
    pub fn expand(&self, args: &[String], quotes: (&str, &str)) -> String {
        let rest = args.get(1..).unwrap_or_default();
        let (left, right) = quotes;

        let mut out = String::new();
        for seg in &self.segs {
            match seg {
                Seg::Text(t) => out.push_str(t),
                Seg::Arg(n) => {
                    if let Some(arg) = args.get(*n) {
                        out.push_str(arg);
                    }
                }
                Seg::Count => out.push_str(&rest.len().to_string()),
                Seg::Star => out.push_str(&rest.join(",")),
                Seg::QuotedStar => {
                    let quoted: Vec<String> = rest
                        .iter()
                        .map(|a| format!("{left}{a}{right}"))
                        .collect();
                    out.push_str(&quoted.join(","));
                }
            }
        }
        out
    }
}

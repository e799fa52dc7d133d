//! Michelson script rewriting.
//!
//! The node embeds contract scripts as a nested JSON AST. Indexed records
//! carry the textual source form instead, so every script, storage and
//! parameters payload is rendered before a block or account is handed to
//! the store. Rendering failure of one field never fails the surrounding
//! block: the field is replaced with an `Unparsable code:` marker and the
//! failure is logged.

use crate::models::{Account, Block, Operation};
use serde::Deserialize;
use serde_json::Value;
use tracing::error;

const UNPARSABLE_PREFIX: &str = "Unparsable code: ";

/// One node of the Michelson JSON AST.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MichelsonNode {
    Int {
        int: String,
    },
    String {
        string: String,
    },
    Bytes {
        bytes: String,
    },
    Primitive {
        prim: String,
        #[serde(default)]
        args: Vec<MichelsonNode>,
        #[serde(default)]
        annots: Vec<String>,
    },
    Sequence(Vec<MichelsonNode>),
}

impl MichelsonNode {
    /// A primitive application with arguments or annotations needs
    /// parentheses when it appears in argument position.
    fn needs_grouping(&self) -> bool {
        matches!(
            self,
            MichelsonNode::Primitive { args, annots, .. }
                if !args.is_empty() || !annots.is_empty()
        )
    }
}

fn render_node(node: &MichelsonNode) -> String {
    match node {
        MichelsonNode::Int { int } => int.clone(),
        MichelsonNode::String { string } => {
            serde_json::to_string(string).unwrap_or_else(|_| format!("\"{}\"", string))
        }
        MichelsonNode::Bytes { bytes } => format!("0x{}", bytes),
        MichelsonNode::Primitive { prim, args, annots } => {
            let mut parts = vec![prim.clone()];
            parts.extend(annots.iter().cloned());
            parts.extend(args.iter().map(render_arg));
            parts.join(" ")
        }
        MichelsonNode::Sequence(nodes) => {
            if nodes.is_empty() {
                "{}".to_string()
            } else {
                let inner: Vec<String> = nodes.iter().map(render_node).collect();
                format!("{{ {} }}", inner.join(" ; "))
            }
        }
    }
}

fn render_arg(node: &MichelsonNode) -> String {
    if node.needs_grouping() {
        format!("({})", render_node(node))
    } else {
        render_node(node)
    }
}

/// Render the `parameter`/`storage`/`code` sections of a contract script.
/// Each section becomes one `prim args;` line.
fn render_schema_node(node: &MichelsonNode) -> String {
    match node {
        MichelsonNode::Sequence(sections) => {
            let rendered: Vec<String> = sections.iter().map(render_node).collect();
            rendered.join(";\n")
        }
        other => render_node(other),
    }
}

fn render_with<F>(value: &Value, render: F) -> String
where
    F: Fn(&MichelsonNode) -> String,
{
    // A field that already holds the unparsable marker is left untouched,
    // which makes the rewrite idempotent on its own output.
    if let Value::String(s) = value {
        if s.starts_with(UNPARSABLE_PREFIX) {
            return s.clone();
        }
    }
    match serde_json::from_value::<MichelsonNode>(value.clone()) {
        Ok(node) => render(&node),
        Err(err) => {
            error!("failed to parse michelson expression: {}", err);
            format!("{}{}", UNPARSABLE_PREFIX, value)
        }
    }
}

/// Render a full script (the `parameter`/`storage`/`code` triple).
pub fn render_schema(value: &Value) -> String {
    render_with(value, render_schema_node)
}

/// Render a single expression (storage values, transaction parameters).
pub fn render_expression(value: &Value) -> String {
    render_with(value, render_node)
}

/// Rewrite every Michelson payload reachable in a block: origination
/// scripts with their initial storage, and transaction parameters.
pub fn transform_block(mut block: Block) -> Block {
    for group in &mut block.operations {
        for op in &mut group.contents {
            match op {
                Operation::Origination {
                    script: Some(scripted),
                    ..
                } => {
                    scripted.code = Value::String(render_schema(&scripted.code));
                    scripted.storage = Value::String(render_expression(&scripted.storage));
                }
                Operation::Transaction {
                    parameters: Some(parameters),
                    ..
                } => {
                    *parameters = Value::String(render_expression(parameters));
                }
                _ => {}
            }
        }
    }
    block
}

/// Rewrite the script and storage of an account snapshot.
pub fn transform_account(mut account: Account) -> Account {
    if let Some(code) = &account.script {
        account.script = Some(Value::String(render_schema(code)));
    }
    if let Some(storage) = &account.storage {
        account.storage = Some(Value::String(render_expression(storage)));
    }
    account
}

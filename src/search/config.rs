//! Parser for the backup-selection document into a [`super::SearchTree`].

use anyhow::{Result, bail};
use regex::Regex;

use super::{ExprEntry, MatchNode, Matcher, SearchTree};
use crate::metadata::Policy;

/// Strips a leading UTF-8 BOM, if present.
fn strip_bom(s: &str) -> &str {
    s.strip_prefix('\u{feff}').unwrap_or(s)
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    strip_bom(text).split(['\n']).map(|l| l.strip_suffix('\r').unwrap_or(l))
}

fn policy_header(line: &str) -> Option<Policy> {
    match line {
        "[none]" => Some(Policy::None),
        "[copy]" => Some(Policy::Copy),
        "[mirror]" => Some(Policy::Mirror),
        "[track]" => Some(Policy::Track),
        "[ignore]" => Some(Policy::Ignore),
        _ => None,
    }
}

impl SearchTree {
    pub fn parse(text: &str) -> Result<SearchTree> {
        let mut tree = SearchTree::empty();
        let mut section: Option<Policy> = None;
        // The deepest node created by the most recent absolute-path line,
        // for the "bracketed regex component ... under an existing path
        // context" grammar rule.
        let mut context: Option<super::NodeId> = None;

        for (i, raw_line) in split_lines(text).enumerate() {
            let line_nr = (i + 1) as u32;
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if raw_line.starts_with('#') {
                continue;
            }

            if let Some(policy) = policy_header(line) {
                section = Some(policy);
                context = None;
                continue;
            }

            if let Some(pattern) = line.strip_prefix("ignore ") {
                let regex = Regex::new(pattern.trim())
                    .with_context_line(line_nr, "invalid ignore regex")?;
                tree.ignore_exprs.push(ExprEntry::new(regex, line_nr));
                continue;
            }

            if let Some(pattern) = line.strip_prefix("summarize ") {
                let regex = Regex::new(pattern.trim())
                    .with_context_line(line_nr, "invalid summarize regex")?;
                tree.summarize_exprs.push(ExprEntry::new(regex, line_nr));
                continue;
            }

            if let Some(path) = line.strip_prefix('/') {
                let Some(policy) = section else {
                    bail!("config: line {line_nr}: path given before any policy header");
                };
                context = Some(tree.insert_path(path, line_nr, policy)?);
                continue;
            }

            if let Some(pattern) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let Some(policy) = section else {
                    bail!("config: line {line_nr}: regex component given before any policy header");
                };
                let Some(parent) = context else {
                    bail!("config: line {line_nr}: regex component has no enclosing path");
                };
                let regex = Regex::new(pattern)
                    .with_context_line(line_nr, "invalid path-component regex")?;
                context = Some(tree.insert_regex_child(parent, regex, line_nr, policy));
                continue;
            }

            bail!("config: line {line_nr}: unrecognized line: \"{line}\"");
        }

        tree.reject_useless_none_policies()?;
        Ok(tree)
    }

    fn insert_path(&mut self, path: &str, line_nr: u32, policy: Policy) -> Result<super::NodeId> {
        let mut parent: Option<super::NodeId> = None;
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            bail!("config: line {line_nr}: blank absolute path");
        }
        for (i, comp) in components.iter().enumerate() {
            if *comp == "." || *comp == ".." {
                bail!("config: line {line_nr}: invalid filename \"{comp}\"");
            }
            let id = self.find_or_create_literal_child(parent, comp.as_bytes(), line_nr);
            if i + 1 == components.len() {
                self.set_policy(id, policy, line_nr)?;
            }
            parent = Some(id);
        }
        Ok(parent.expect("at least one component"))
    }

    fn find_or_create_literal_child(
        &mut self,
        parent: Option<super::NodeId>,
        name: &[u8],
        line_nr: u32,
    ) -> super::NodeId {
        let existing = {
            let children: &[super::NodeId] = match parent {
                None => &self.roots,
                Some(p) => self.nodes[p as usize].children.as_deref().unwrap_or(&[]),
            };
            children.iter().copied().find(|&c| {
                matches!(&self.nodes[c as usize].matcher, Matcher::Literal(n) if n.as_slice() == name)
            })
        };
        if let Some(id) = existing {
            return id;
        }

        let id = self.nodes.len() as super::NodeId;
        self.nodes.push(MatchNode {
            matcher: Matcher::Literal(name.to_vec()),
            policy: None,
            line_nr,
            policy_line_nr: None,
            children: None,
            subnodes_contain_regex: false,
            matched: std::cell::Cell::new(false),
        });
        match parent {
            None => self.roots.push(id),
            Some(p) => self.nodes[p as usize].children.get_or_insert_with(Vec::new).push(id),
        }
        id
    }

    fn insert_regex_child(
        &mut self,
        parent: super::NodeId,
        regex: Regex,
        line_nr: u32,
        policy: Policy,
    ) -> super::NodeId {
        let id = self.nodes.len() as super::NodeId;
        self.nodes.push(MatchNode {
            matcher: Matcher::Regex(regex),
            policy: None,
            line_nr,
            policy_line_nr: None,
            children: None,
            subnodes_contain_regex: false,
            matched: std::cell::Cell::new(false),
        });
        self.nodes[parent as usize].subnodes_contain_regex = true;
        self.nodes[parent as usize].children.get_or_insert_with(Vec::new).push(id);
        // Policy-setting on a regex child can't fail (it's freshly created).
        self.set_policy(id, policy, line_nr).expect("fresh node");
        id
    }

    fn set_policy(&mut self, id: super::NodeId, policy: Policy, line_nr: u32) -> Result<()> {
        let node = &mut self.nodes[id as usize];
        match node.policy_line_nr {
            Some(prev_line) if node.policy != Some(policy) => {
                bail!("redefining policy of line {prev_line}")
            }
            Some(_) => {}
            None => {
                node.policy = Some(policy);
                node.policy_line_nr = Some(line_nr);
            }
        }
        Ok(())
    }

    /// Every node reachable through `subnodes` must have a policy other
    /// than `None`, or a descendant that does. `[none]` exists purely to
    /// give structure to deeper real policies.
    fn reject_useless_none_policies(&self) -> Result<()> {
        for &id in &self.roots {
            self.check_none_policy_subtree(id)?;
        }
        Ok(())
    }

    fn check_none_policy_subtree(&self, id: super::NodeId) -> Result<bool> {
        let node = &self.nodes[id as usize];
        let mut any_real_descendant = false;
        if let Some(children) = &node.children {
            for &child in children {
                if self.check_none_policy_subtree(child)? {
                    any_real_descendant = true;
                }
            }
        }
        let has_real_policy = !matches!(node.policy, None | Some(Policy::None));
        if matches!(node.policy, Some(Policy::None)) && !any_real_descendant {
            bail!(
                "config: line {}: [none] policy has no real descendant policy",
                node.policy_line_nr.unwrap_or(node.line_nr)
            );
        }
        Ok(has_real_policy || any_real_descendant)
    }
}

trait WithContextLine<T> {
    fn with_context_line(self, line_nr: u32, msg: &str) -> Result<T>;
}

impl<T> WithContextLine<T> for std::result::Result<T, regex::Error> {
    fn with_context_line(self, line_nr: u32, msg: &str) -> Result<T> {
        self.map_err(|e| anyhow::anyhow!("config: line {line_nr}: {msg}: {e}"))
    }
}

//! Tree speculation.
//!
//! Instead of a single draft chain, the draft model expands the `breadth`
//! best candidates at every node down to `depth` levels. Every root-to-leaf
//! path is verified against the target in parallel and the path with the
//! longest accepted prefix wins.

use std::cmp::Reverse;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use tristream_config::SpeculativeConfig;
use tristream_core::{Error, Result, TokenId};

use crate::speculative::{accepts, DraftModel, ScoredToken, TargetModel};

/// Default cap on nodes in one tree, root included.
pub const DEFAULT_MAX_TREE_NODES: usize = 1024;

/// A node in a speculation tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Drafted token (the context anchor for the root)
    pub token: ScoredToken,
    /// Distance from the root
    pub depth: usize,
    /// Parent index; `None` for the root
    pub parent: Option<usize>,
    /// Child indices
    pub children: Vec<usize>,
}

/// Arena of drafted continuations rooted at the current context.
#[derive(Debug, Clone)]
pub struct SpeculativeTree {
    nodes: Vec<TreeNode>,
}

impl SpeculativeTree {
    fn new(anchor: TokenId) -> Self {
        Self {
            nodes: vec![TreeNode {
                token: ScoredToken::new(anchor, 0.0),
                depth: 0,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    fn add(&mut self, parent: usize, token: ScoredToken) -> usize {
        let idx = self.nodes.len();
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(TreeNode {
            token,
            depth,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(idx);
        idx
    }

    /// The root node.
    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    /// Node by index.
    pub fn node(&self, idx: usize) -> Option<&TreeNode> {
        self.nodes.get(idx)
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a tree has at least its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deepest level.
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Drafted tokens along `idx`'s path, root excluded.
    pub fn path_to(&self, idx: usize) -> Vec<ScoredToken> {
        let mut path = Vec::new();
        let mut cur = Some(idx);
        while let Some(i) = cur {
            let node = &self.nodes[i];
            if node.parent.is_none() {
                break;
            }
            path.push(node.token);
            cur = node.parent;
        }
        path.reverse();
        path
    }

    /// Every root-to-leaf path, root excluded.
    pub fn leaf_paths(&self) -> Vec<Vec<ScoredToken>> {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, n)| n.children.is_empty())
            .map(|(i, _)| self.path_to(i))
            .collect()
    }
}

/// Winning path of a verified tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeVerification {
    /// Emitted tokens: accepted prefix plus a correction or bonus token
    pub tokens: Vec<ScoredToken>,
    /// Drafted tokens accepted on the winning path
    pub accepted: usize,
    /// Leaf paths verified
    pub paths_checked: usize,
}

/// Running totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStats {
    /// Trees verified
    pub iterations: u64,
    /// Nodes drafted (root excluded)
    pub nodes_drafted: u64,
    /// Tokens accepted on winning paths
    pub accepted: u64,
    /// Tokens emitted
    pub emitted: u64,
}

/// Tree-shaped speculative decoder.
pub struct TreeSpeculator {
    config: SpeculativeConfig,
    breadth: usize,
    depth: usize,
    max_nodes: usize,
    draft: Arc<dyn DraftModel>,
    target: Arc<dyn TargetModel>,
    stats: Mutex<TreeStats>,
}

impl TreeSpeculator {
    /// Create a speculator. `breadth` and `depth` are raised to at least 1.
    pub fn new(
        config: SpeculativeConfig,
        breadth: usize,
        depth: usize,
        draft: Arc<dyn DraftModel>,
        target: Arc<dyn TargetModel>,
    ) -> Self {
        Self {
            config,
            breadth: breadth.max(1),
            depth: depth.max(1),
            max_nodes: DEFAULT_MAX_TREE_NODES,
            draft,
            target,
            stats: Mutex::new(TreeStats::default()),
        }
    }

    /// Candidates per node.
    pub fn breadth(&self) -> usize {
        self.breadth
    }

    /// Levels below the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Cap the tree size. Expansion stops once `max_nodes` nodes exist;
    /// the root and one child are always allowed.
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes.max(2);
        self
    }

    /// Node cap.
    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Expand the draft tree for `context`.
    ///
    /// Fails if the draft model offers no candidate for the first position.
    pub fn generate_tree(&self, context: &[TokenId]) -> Result<SpeculativeTree> {
        let mut tree = SpeculativeTree::new(context.last().copied().unwrap_or(0));
        let mut frontier = vec![0usize];

        'levels: for _ in 0..self.depth {
            let mut next = Vec::with_capacity(frontier.len() * self.breadth);
            for &parent in &frontier {
                let room = self.max_nodes.saturating_sub(tree.len());
                if room == 0 {
                    break 'levels;
                }
                let mut ctx = context.to_vec();
                ctx.extend(tree.path_to(parent).iter().map(|t| t.id));
                for candidate in self.draft.top_candidates(&ctx, self.breadth.min(room))? {
                    next.push(tree.add(parent, candidate));
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        if tree.root().children.is_empty() {
            return Err(Error::Speculative(
                "draft model offered no candidates for the tree root".into(),
            ));
        }
        Ok(tree)
    }

    /// Verify every leaf path and keep the longest accepted one.
    pub fn verify(&self, context: &[TokenId], tree: &SpeculativeTree) -> Result<TreeVerification> {
        let paths = tree.leaf_paths();
        let results = paths
            .par_iter()
            .map(|path| self.verify_path(context, path))
            .collect::<Result<Vec<_>>>()?;

        let paths_checked = results.len();
        let (accepted, tokens) = results
            .into_iter()
            .enumerate()
            .max_by_key(|(i, (accepted, _))| (*accepted, Reverse(*i)))
            .map(|(_, r)| r)
            .ok_or_else(|| Error::Speculative("speculation tree has no leaves".into()))?;

        Ok(TreeVerification {
            tokens,
            accepted,
            paths_checked,
        })
    }

    fn verify_path(
        &self,
        context: &[TokenId],
        path: &[ScoredToken],
    ) -> Result<(usize, Vec<ScoredToken>)> {
        let ids: Vec<TokenId> = path.iter().map(|t| t.id).collect();
        let scores = self.target.score(context, &ids)?;

        let mut tokens = Vec::with_capacity(path.len() + 1);
        for (draft, score) in path.iter().zip(&scores) {
            if accepts(&self.config, score.logprob, draft.logprob) {
                tokens.push(ScoredToken::new(draft.id, score.logprob));
            } else {
                let accepted = tokens.len();
                tokens.push(ScoredToken::new(score.best, score.best_logprob));
                return Ok((accepted, tokens));
            }
        }
        let accepted = tokens.len();
        if let Some(bonus) = scores.get(path.len()) {
            tokens.push(ScoredToken::new(bonus.best, bonus.best_logprob));
        }
        if tokens.is_empty() {
            return Err(Error::Speculative("target returned no scores".into()));
        }
        Ok((accepted, tokens))
    }

    /// Generate, verify and emit at most `max_tokens` (at least one) tokens.
    pub fn step(&self, context: &[TokenId], max_tokens: usize) -> Result<TreeVerification> {
        let tree = self.generate_tree(context)?;
        let mut result = self.verify(context, &tree)?;
        result.tokens.truncate(max_tokens.max(1));
        result.accepted = result.accepted.min(result.tokens.len());

        let mut stats = self.stats.lock();
        stats.iterations += 1;
        stats.nodes_drafted += (tree.len() - 1) as u64;
        stats.accepted += result.accepted as u64;
        stats.emitted += result.tokens.len() as u64;
        debug!(
            "Tree step: {} nodes, {} paths, {} accepted",
            tree.len() - 1,
            result.paths_checked,
            result.accepted
        );
        Ok(result)
    }

    /// Running totals.
    pub fn stats(&self) -> TreeStats {
        self.stats.lock().clone()
    }
}

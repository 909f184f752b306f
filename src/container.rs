use std::collections::{HashMap, HashSet};

use crate::resource::{Resource, VerbHandlers};
use crate::route::Route;

/// Handle to a node in the resource arena.  Identifies the node for the
/// whole lifetime of its [`crate::Site`]; slots are never reused, so a stale
/// id can only ever point at a tombstoned (detached) node, never at an
/// unrelated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// A resource-tree node.  Owns its child groups (name to ordered ids), a
/// non-owning back-reference to its parent, the resource data, and the
/// outgoing header/cookie buffers.
pub(crate) struct Node {
    pub name: String,
    pub url_name: String,
    pub parent: Option<NodeId>,
    pub detached: bool,
    pub data: serde_json::Value,
    pub children: HashMap<String, Vec<NodeId>>,
    pub view: Option<String>,
    pub layout: Option<String>,
    pub parameter_names: Vec<String>,
    pub out_format: Option<String>,
    pub headers: http::HeaderMap,
    pub cookies: Vec<String>,
    pub handlers: VerbHandlers,
}

impl Node {
    fn root(name: &str) -> Self {
        Node {
            name: name.to_owned(),
            url_name: "site".to_owned(),
            parent: None,
            detached: false,
            data: serde_json::Value::Object(Default::default()),
            children: HashMap::new(),
            view: None,
            layout: None,
            parameter_names: vec![],
            out_format: None,
            headers: http::HeaderMap::new(),
            cookies: vec![],
            handlers: VerbHandlers::default(),
        }
    }

    pub fn has_children(&self) -> bool {
        self.children.values().any(|group| !group.is_empty())
    }
}

/// A transient resolution result: the selected child plus the route
/// remainder.  Produced by one resolution step and consumed by the next;
/// never persisted.  The verb travels on the route itself.
#[derive(Debug)]
pub(crate) struct Direction {
    pub resource: NodeId,
    pub route: Route,
}

/// Single-owner table of resource nodes; children reference each other by
/// [`NodeId`], never by pointer, so the whole tree lives behind one lock on
/// the owning [`crate::Site`].
pub(crate) struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    /// Creates an arena holding only the synthetic root node.
    pub fn new(site_name: &str) -> (Arena, NodeId) {
        let arena = Arena {
            nodes: vec![Node::root(site_name)],
        };
        (arena, NodeId(0))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Instantiates the given descriptor (recursively, for its nested
    /// descriptors) under `parent`, preserving declaration order as child
    /// array insertion order.  The slugified name is the routing key; an
    /// existing group for that name is appended to, never replaced.
    pub fn add(&mut self, parent: NodeId, def: Resource) -> NodeId {
        let url_name = slugify(&def.name);
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: def.name,
            url_name: url_name.clone(),
            parent: Some(parent),
            detached: false,
            data: def.data,
            children: HashMap::new(),
            view: def.view,
            layout: def.layout,
            parameter_names: def.parameters,
            out_format: def.out_format,
            headers: def.headers,
            cookies: def.cookies,
            handlers: def.handlers,
        });
        self.nodes[parent.0]
            .children
            .entry(url_name.clone())
            .or_default()
            .push(id);
        log::info!("+ {}", url_name);
        for child in def.children {
            self.add(id, child);
        }
        id
    }

    /// Identity-based removal of `child` from its parent's group.  Severs
    /// both directions and tombstones the node.  Returns `false` when the
    /// child is not attached anywhere (idempotent, not an error).
    pub fn remove(&mut self, child: NodeId) -> bool {
        let (parent, url_name) = {
            let node = self.node(child);
            match node.parent {
                Some(parent) if !node.detached => (parent, node.url_name.clone()),
                _ => return false,
            }
        };
        let group = match self.nodes[parent.0].children.get_mut(&url_name) {
            Some(group) => group,
            None => return false,
        };
        let idx = match group.iter().position(|id| *id == child) {
            Some(idx) => idx,
            None => return false,
        };
        group.remove(idx);
        let node = self.node_mut(child);
        node.parent = None;
        node.detached = true;
        log::info!("- {}", node.url_name);
        true
    }

    /// One step of path resolution from `from`, as described by the route.
    ///
    /// The route is advanced by one segment and the new leading segment is
    /// read as the child group name.  With several same-named siblings the
    /// following segment is consumed as an explicit index when it parses as
    /// a non-negative integer; a non-numeric segment is left for the next
    /// resolution level, and an out-of-range index falls back to position 0.
    pub fn resolve_step(&self, from: NodeId, route: &Route) -> Option<Direction> {
        let mut route = route.step_through(1);
        let name = route.next_step()?.to_owned();
        let group = self.node(from).children.get(&name)?;
        if group.is_empty() {
            return None;
        }

        let mut idx = 0;
        if group.len() > 1 {
            if let Some(next) = route.path.get(1) {
                if let Ok(parsed) = next.parse::<usize>() {
                    idx = parsed;
                    route = route.step_through(1);
                }
            }
        }
        let resource = group.get(idx).copied().unwrap_or(group[0]);
        log::trace!("access resource {:?}[{}]", name, idx);
        Some(Direction { resource, route })
    }

    /// Full resolution of a pathname: repeated step-resolution until no
    /// further segment remains to descend into.  Fails as a whole if any
    /// step fails; no partial result is returned.
    pub fn resolve_full(&self, from: NodeId, pathname: &str) -> Option<NodeId> {
        let route = Route::new(pathname);
        if route.remaining() <= 1 {
            return Some(from);
        }
        let mut direction = self.resolve_step(from, &route)?;
        while direction.route.remaining() > 1 {
            direction = self.resolve_step(direction.resource, &direction.route)?;
        }
        Some(direction.resource)
    }

    /// Number of children in the given name group.
    pub fn child_type_count(&self, id: NodeId, type_name: &str) -> usize {
        self.node(id)
            .children
            .get(type_name)
            .map_or(0, Vec::len)
    }

    /// Total number of children across all of this node's groups.
    pub fn children_count(&self, id: NodeId) -> usize {
        self.node(id).children.values().map(Vec::len).sum()
    }

    /// The node plus every descendant reachable from it.
    pub fn subtree(&self, id: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                for group in self.node(current).children.values() {
                    stack.extend(group.iter().copied());
                }
            }
        }
        seen
    }
}

/// Normalizes a resource name into a URL-safe routing token: lowercased,
/// trimmed, diacritics folded, whitespace runs collapsed to `-`, anything
/// else unsafe dropped.
pub(crate) fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars().flat_map(char::to_lowercase) {
        let ch = fold_diacritic(ch);
        if ch.is_whitespace() {
            pending_dash = !out.is_empty();
        } else if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            if pending_dash {
                out.push('-');
                pending_dash = false;
            }
            out.push(ch);
        }
    }
    out
}

fn fold_diacritic(ch: char) -> char {
    match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

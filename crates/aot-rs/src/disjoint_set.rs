/// Arena-backed union-find over dense `usize` keys.
///
/// Uses path compression on lookup and union by size.
#[derive(Debug, Clone, Default)]
pub struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            size: vec![1; len],
        }
    }

    /// Adds a singleton set and returns its key.
    pub fn push(&mut self) -> usize {
        let key = self.parent.len();
        self.parent.push(key);
        self.size.push(1);
        key
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, key: usize) -> usize {
        let mut root = key;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = key;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Merges the sets holding `a` and `b`; returns the surviving representative.
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let mut ra = self.find(a);
        let mut rb = self.find(b);
        if ra == rb {
            return ra;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        ra
    }

    pub fn same_set(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    pub fn set_size(&mut self, key: usize) -> usize {
        let root = self.find(key);
        self.size[root]
    }

    /// Groups every key by representative, ordered by smallest member.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: Vec<Option<usize>> = vec![None; self.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for key in 0..self.len() {
            let root = self.find(key);
            let slot = match by_root[root] {
                Some(slot) => slot,
                None => {
                    groups.push(Vec::new());
                    by_root[root] = Some(groups.len() - 1);
                    groups.len() - 1
                }
            };
            groups[slot].push(key);
        }
        groups
    }
}

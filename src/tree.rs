use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use crate::error::{KdbxError, TreeError};

pub const TITLE: &str = "Title";
pub const USERNAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Times {
    pub creation: DateTime<Utc>,
    pub last_modification: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub expires: bool,
    pub usage_count: u32,
    pub location_changed: DateTime<Utc>,
}

impl Times {
    pub fn now() -> Self {
        // serialized with whole seconds only
        let now = Utc::now().trunc_subsecs(0);
        Self {
            creation: now,
            last_modification: now,
            last_access: now,
            expiry: now,
            expires: false,
            usage_count: 0,
            location_changed: now,
        }
    }

    pub fn touch(&mut self) {
        let now = Utc::now().trunc_subsecs(0);
        self.last_modification = now;
        self.last_access = now;
    }
}

/// One key/value field of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Str {
    pub key: String,
    pub value: String,
    pub protected: bool,
}

impl Str {
    pub fn new(key: impl Into<String>, value: impl Into<String>, protected: bool) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            protected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub window: String,
    pub keystroke_sequence: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoType {
    pub enabled: bool,
    pub data_transfer_obfuscation: i32,
    pub default_sequence: Option<String>,
    pub associations: Vec<Association>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            data_transfer_obfuscation: 0,
            default_sequence: None,
            associations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub uuid: Uuid,
    pub icon_id: u32,
    pub foreground_color: String,
    pub background_color: String,
    pub override_url: String,
    pub tags: String,
    pub times: Times,
    pub strings: Vec<Str>,
    pub auto_type: AutoType,
    pub history: Vec<Entry>,
}

impl Entry {
    /// Entry with the five standard fields, the password one protected.
    pub fn new(title: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            icon_id: 0,
            foreground_color: String::new(),
            background_color: String::new(),
            override_url: String::new(),
            tags: String::new(),
            times: Times::now(),
            strings: vec![
                Str::new(TITLE, title, false),
                Str::new(USERNAME, "", false),
                Str::new(PASSWORD, "", true),
                Str::new(URL, "", false),
                Str::new(NOTES, "", false),
            ],
            auto_type: AutoType::default(),
            history: Vec::new(),
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.strings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.as_str())
    }

    /// Replaces the value of `key`, or appends a new field. The protection
    /// flag of an existing field is kept.
    pub fn set_field(&mut self, key: &str, value: &str, protected: bool) {
        match self.strings.iter_mut().find(|s| s.key == key) {
            Some(s) => s.value = value.to_string(),
            None => self.strings.push(Str::new(key, value, protected)),
        }
    }

    pub fn title(&self) -> &str {
        self.field(TITLE).unwrap_or_default()
    }

    pub fn username(&self) -> &str {
        self.field(USERNAME).unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.field(PASSWORD).unwrap_or_default()
    }

    pub fn url(&self) -> &str {
        self.field(URL).unwrap_or_default()
    }

    pub fn notes(&self) -> &str {
        self.field(NOTES).unwrap_or_default()
    }

    /// Pushes a copy of the current state onto the history list.
    pub fn snapshot(&mut self) {
        let mut previous = self.clone();
        previous.history.clear();
        self.history.push(previous);
    }

    fn map_protected<F>(mut self, f: &mut F) -> Result<Self, KdbxError>
    where
        F: FnMut(&str) -> Result<String, KdbxError>,
    {
        for s in self.strings.iter_mut().filter(|s| s.protected) {
            s.value = f(&s.value)?;
        }
        self.history = self
            .history
            .into_iter()
            .map(|h| h.map_protected(f))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub icon_id: u32,
    pub times: Times,
    pub is_expanded: bool,
    pub default_auto_type_sequence: String,
    pub enable_auto_type: Option<bool>,
    pub enable_searching: Option<bool>,
    pub last_top_visible_entry: Uuid,
    pub groups: Vec<Group>,
    pub entries: Vec<Entry>,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            notes: String::new(),
            icon_id: 48,
            times: Times::now(),
            is_expanded: true,
            default_auto_type_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: Uuid::nil(),
            groups: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Direct child groups plus direct entries.
    pub fn item_count(&self) -> usize {
        self.groups.len() + self.entries.len()
    }

    fn group(&self, uuid: Uuid) -> Option<&Group> {
        if self.uuid == uuid {
            return Some(self);
        }
        self.groups.iter().find_map(|g| g.group(uuid))
    }

    fn group_mut(&mut self, uuid: Uuid) -> Option<&mut Group> {
        if self.uuid == uuid {
            return Some(self);
        }
        self.groups.iter_mut().find_map(|g| g.group_mut(uuid))
    }

    fn entry(&self, uuid: Uuid) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.uuid == uuid)
            .or_else(|| self.groups.iter().find_map(|g| g.entry(uuid)))
    }

    fn entry_mut(&mut self, uuid: Uuid) -> Option<&mut Entry> {
        if let Some(pos) = self.entries.iter().position(|e| e.uuid == uuid) {
            return Some(&mut self.entries[pos]);
        }
        self.groups.iter_mut().find_map(|g| g.entry_mut(uuid))
    }

    fn remove_entry(&mut self, uuid: Uuid) -> Option<Entry> {
        if let Some(pos) = self.entries.iter().position(|e| e.uuid == uuid) {
            return Some(self.entries.remove(pos));
        }
        self.groups.iter_mut().find_map(|g| g.remove_entry(uuid))
    }

    fn remove_group(&mut self, uuid: Uuid) -> Option<Group> {
        if let Some(pos) = self.groups.iter().position(|g| g.uuid == uuid) {
            return Some(self.groups.remove(pos));
        }
        self.groups.iter_mut().find_map(|g| g.remove_group(uuid))
    }

    fn collect_entries<'a>(&'a self, out: &mut Vec<&'a Entry>) {
        out.extend(self.entries.iter());
        for g in &self.groups {
            g.collect_entries(out);
        }
    }

    fn map_protected<F>(mut self, f: &mut F) -> Result<Self, KdbxError>
    where
        F: FnMut(&str) -> Result<String, KdbxError>,
    {
        self.entries = self
            .entries
            .into_iter()
            .map(|e| e.map_protected(f))
            .collect::<Result<_, _>>()?;
        self.groups = self
            .groups
            .into_iter()
            .map(|g| g.map_protected(f))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_username: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_username: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub generator: String,
    /// Base64 SHA-256 of the outer header this document was written with.
    pub header_hash: Option<String>,
    pub database_name: String,
    pub database_description: String,
    pub default_username: String,
    pub memory_protection: MemoryProtection,
    pub recycle_bin_enabled: bool,
    pub recycle_bin_uuid: Uuid,
    pub history_max_items: i32,
    pub history_max_size: i64,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            generator: "cardvault".into(),
            header_hash: None,
            database_name: String::new(),
            database_description: String::new(),
            default_username: String::new(),
            memory_protection: MemoryProtection::default(),
            recycle_bin_enabled: false,
            recycle_bin_uuid: Uuid::nil(),
            history_max_items: 10,
            history_max_size: 6 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Title,
    Username,
    Url,
    Notes,
}

impl SearchField {
    pub const ALL: [SearchField; 4] = [Self::Title, Self::Username, Self::Url, Self::Notes];

    fn value(self, entry: &Entry) -> &str {
        match self {
            Self::Title => entry.title(),
            Self::Username => entry.username(),
            Self::Url => entry.url(),
            Self::Notes => entry.notes(),
        }
    }
}

/// Matches of a [`VaultTree::search`], one bucket per field. An entry that
/// matches on several fields shows up in each of those buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResults {
    pub title: Vec<Entry>,
    pub username: Vec<Entry>,
    pub url: Vec<Entry>,
    pub notes: Vec<Entry>,
}

impl SearchResults {
    pub fn bucket(&self, field: SearchField) -> &[Entry] {
        match field {
            SearchField::Title => &self.title,
            SearchField::Username => &self.username,
            SearchField::Url => &self.url,
            SearchField::Notes => &self.notes,
        }
    }

    fn bucket_mut(&mut self, field: SearchField) -> &mut Vec<Entry> {
        match field {
            SearchField::Title => &mut self.title,
            SearchField::Username => &mut self.username,
            SearchField::Url => &mut self.url,
            SearchField::Notes => &mut self.notes,
        }
    }

    pub fn is_empty(&self) -> bool {
        SearchField::ALL.iter().all(|f| self.bucket(*f).is_empty())
    }
}

/// The decrypted vault: metadata, exactly one root group and the deletion
/// log.
///
/// Mutations look items up by UUID, depth first, and the first match wins.
/// The plain variants do nothing when the UUID is unknown; the `try_`
/// variants report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultTree {
    pub meta: Meta,
    root: Group,
    pub deleted_objects: Vec<DeletedObject>,
}

impl VaultTree {
    pub fn new(name: &str) -> Self {
        let meta = Meta {
            database_name: name.to_string(),
            ..Meta::default()
        };
        Self {
            meta,
            root: Group::new(name),
            deleted_objects: Vec::new(),
        }
    }

    pub fn from_parts(meta: Meta, root: Group, deleted_objects: Vec<DeletedObject>) -> Self {
        Self {
            meta,
            root,
            deleted_objects,
        }
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn group(&self, uuid: Uuid) -> Option<&Group> {
        self.root.group(uuid)
    }

    pub fn entry(&self, uuid: Uuid) -> Option<&Entry> {
        self.root.entry(uuid)
    }

    /// Every current entry in traversal order: a group's own entries, then
    /// its child groups.
    pub fn entries(&self) -> Vec<&Entry> {
        let mut out = Vec::new();
        self.root.collect_entries(&mut out);
        out
    }

    pub fn add_entry(&mut self, parent: Uuid, entry: Entry) {
        let _ = self.try_add_entry(parent, entry);
    }

    pub fn try_add_entry(&mut self, parent: Uuid, entry: Entry) -> Result<(), TreeError> {
        let group = self
            .root
            .group_mut(parent)
            .ok_or(TreeError::GroupNotFound(parent))?;
        group.entries.push(entry);
        Ok(())
    }

    pub fn add_group(&mut self, parent: Uuid, group: Group) {
        let _ = self.try_add_group(parent, group);
    }

    pub fn try_add_group(&mut self, parent: Uuid, group: Group) -> Result<(), TreeError> {
        let target = self
            .root
            .group_mut(parent)
            .ok_or(TreeError::GroupNotFound(parent))?;
        target.groups.push(group);
        Ok(())
    }

    pub fn update_entry(&mut self, entry: Entry) {
        let _ = self.try_update_entry(entry);
    }

    pub fn try_update_entry(&mut self, entry: Entry) -> Result<(), TreeError> {
        let uuid = entry.uuid;
        let slot = self
            .root
            .entry_mut(uuid)
            .ok_or(TreeError::EntryNotFound(uuid))?;
        *slot = entry;
        Ok(())
    }

    /// Replaces the group with the same UUID. Passing the root's UUID
    /// replaces the root.
    pub fn update_group(&mut self, group: Group) {
        let _ = self.try_update_group(group);
    }

    pub fn try_update_group(&mut self, group: Group) -> Result<(), TreeError> {
        let uuid = group.uuid;
        let slot = self
            .root
            .group_mut(uuid)
            .ok_or(TreeError::GroupNotFound(uuid))?;
        *slot = group;
        Ok(())
    }

    pub fn delete_entry(&mut self, uuid: Uuid) {
        let _ = self.try_delete_entry(uuid);
    }

    pub fn try_delete_entry(&mut self, uuid: Uuid) -> Result<Entry, TreeError> {
        let removed = self
            .root
            .remove_entry(uuid)
            .ok_or(TreeError::EntryNotFound(uuid))?;
        self.record_deletion(uuid);
        Ok(removed)
    }

    /// Removes a group and everything under it. The root cannot be deleted.
    pub fn delete_group(&mut self, uuid: Uuid) {
        let _ = self.try_delete_group(uuid);
    }

    pub fn try_delete_group(&mut self, uuid: Uuid) -> Result<Group, TreeError> {
        let removed = self
            .root
            .remove_group(uuid)
            .ok_or(TreeError::GroupNotFound(uuid))?;
        self.record_deletion(uuid);
        Ok(removed)
    }

    fn record_deletion(&mut self, uuid: Uuid) {
        self.deleted_objects.push(DeletedObject {
            uuid,
            deletion_time: Utc::now().trunc_subsecs(0),
        });
    }

    /// Copies of the entries whose title contains `title`, ignoring case.
    pub fn find_entries(&self, title: &str) -> Vec<Entry> {
        self.search(title, &[SearchField::Title]).title
    }

    /// Case-insensitive substring search over the selected fields.
    pub fn search(&self, query: &str, fields: &[SearchField]) -> SearchResults {
        let needle = query.to_lowercase();
        let mut results = SearchResults::default();
        for entry in self.entries() {
            for field in fields {
                if field.value(entry).to_lowercase().contains(&needle) {
                    results.bucket_mut(*field).push(entry.clone());
                }
            }
        }
        results
    }

    /// Rewrites every protected value with `f`, visiting each group's
    /// entries (fields in order, then history) before its child groups.
    /// This is the order the inner stream cipher consumes its keystream in.
    pub fn map_protected<F>(self, mut f: F) -> Result<Self, KdbxError>
    where
        F: FnMut(&str) -> Result<String, KdbxError>,
    {
        let root = self.root.map_protected(&mut f)?;
        Ok(Self { root, ..self })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, username: &str, url: &str) -> Entry {
        let mut e = Entry::new(title);
        e.set_field(USERNAME, username, false);
        e.set_field(URL, url, false);
        e
    }

    /// root { e1, Work { e2, Deep { e3 } }, Home { e4 } }
    fn sample() -> (VaultTree, Vec<Uuid>) {
        let mut tree = VaultTree::new("Vault");
        let root = tree.root().uuid;

        let work = Group::new("Work");
        let deep = Group::new("Deep");
        let home = Group::new("Home");
        let (work_id, deep_id, home_id) = (work.uuid, deep.uuid, home.uuid);

        let e1 = entry("GitHub", "octo", "https://github.com");
        let e2 = entry("Jira", "alice", "https://jira.example.com");
        let e3 = entry("Build Server", "ci", "ssh://build");
        let e4 = entry("Router", "admin", "http://192.168.1.1");
        let ids = vec![e1.uuid, e2.uuid, e3.uuid, e4.uuid, work_id, deep_id, home_id];

        tree.add_entry(root, e1);
        tree.add_group(root, work);
        tree.add_group(work_id, deep);
        tree.add_group(root, home);
        tree.add_entry(work_id, e2);
        tree.add_entry(deep_id, e3);
        tree.add_entry(home_id, e4);
        (tree, ids)
    }

    #[test]
    fn new_tree_has_single_empty_root() {
        let tree = VaultTree::new("Vault");
        assert_eq!(tree.root().name, "Vault");
        assert_eq!(tree.root().item_count(), 0);
        assert_eq!(tree.meta.database_name, "Vault");
    }

    #[test]
    fn add_and_lookup_nested_items() {
        let (tree, ids) = sample();
        assert_eq!(tree.entry(ids[2]).unwrap().title(), "Build Server");
        assert_eq!(tree.group(ids[5]).unwrap().name, "Deep");
        assert_eq!(tree.root().item_count(), 3);
        assert_eq!(tree.group(ids[4]).unwrap().item_count(), 2);
    }

    #[test]
    fn add_to_unknown_parent_is_silent() {
        let (mut tree, _) = sample();
        let before = tree.clone();
        tree.add_entry(Uuid::new_v4(), Entry::new("lost"));
        assert_eq!(tree, before);

        let missing = Uuid::new_v4();
        assert_eq!(
            tree.try_add_group(missing, Group::new("lost")),
            Err(TreeError::GroupNotFound(missing))
        );
    }

    #[test]
    fn update_entry_replaces_by_uuid() {
        let (mut tree, ids) = sample();
        let mut e = tree.entry(ids[2]).unwrap().clone();
        e.set_field(PASSWORD, "s3cret", true);
        tree.update_entry(e);
        assert_eq!(tree.entry(ids[2]).unwrap().password(), "s3cret");
    }

    #[test]
    fn update_unknown_entry_is_silent() {
        let (mut tree, _) = sample();
        let before = tree.clone();
        let stray = Entry::new("stray");
        let stray_id = stray.uuid;

        tree.update_entry(stray.clone());
        assert_eq!(tree, before);
        assert_eq!(
            tree.try_update_entry(stray),
            Err(TreeError::EntryNotFound(stray_id))
        );
    }

    #[test]
    fn updating_root_replaces_it() {
        let (mut tree, _) = sample();
        let mut root = tree.root().clone();
        root.name = "Renamed".into();
        root.groups.clear();
        tree.update_group(root);
        assert_eq!(tree.root().name, "Renamed");
        assert_eq!(tree.root().item_count(), 1);
    }

    #[test]
    fn delete_entry_searches_child_groups() {
        let (mut tree, ids) = sample();
        tree.delete_entry(ids[2]);
        assert!(tree.entry(ids[2]).is_none());
        assert_eq!(tree.entries().len(), 3);
        assert_eq!(tree.deleted_objects.len(), 1);
        assert_eq!(tree.deleted_objects[0].uuid, ids[2]);
    }

    #[test]
    fn delete_group_removes_subtree() {
        let (mut tree, ids) = sample();
        let removed = tree.try_delete_group(ids[4]).unwrap();
        assert_eq!(removed.name, "Work");
        assert!(tree.group(ids[5]).is_none());
        assert!(tree.entry(ids[1]).is_none());
        assert_eq!(tree.entries().len(), 2);
    }

    #[test]
    fn deleting_root_or_unknown_is_a_noop() {
        let (mut tree, _) = sample();
        let before = tree.clone();
        tree.delete_group(tree.root().uuid);
        tree.delete_entry(Uuid::new_v4());
        assert_eq!(tree, before);
    }

    #[test]
    fn entries_follow_traversal_order() {
        let (tree, _) = sample();
        let titles: Vec<_> = tree.entries().iter().map(|e| e.title().to_string()).collect();
        assert_eq!(titles, vec!["GitHub", "Jira", "Build Server", "Router"]);
    }

    #[test]
    fn find_entries_is_case_insensitive_substring() {
        let (tree, _) = sample();
        let hits = tree.find_entries("SERV");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title(), "Build Server");
        assert!(tree.find_entries("nothing").is_empty());
    }

    #[test]
    fn search_fills_per_field_buckets() {
        let (tree, _) = sample();
        let results = tree.search("git", &SearchField::ALL);
        assert_eq!(results.title.len(), 1);
        assert_eq!(results.url.len(), 1);
        assert!(results.username.is_empty());

        let results = tree.search("a", &[SearchField::Username]);
        let names: Vec<_> = results.username.iter().map(|e| e.username()).collect();
        assert_eq!(names, vec!["alice", "admin"]);
        assert!(results.title.is_empty());
    }

    #[test]
    fn map_protected_visits_entries_history_then_groups() {
        let mut tree = VaultTree::new("Vault");
        let root = tree.root().uuid;
        let child = Group::new("child");
        let child_id = child.uuid;
        tree.add_group(root, child);

        let mut nested = Entry::new("nested");
        nested.set_field(PASSWORD, "p3", true);
        tree.add_entry(child_id, nested);

        let mut top = Entry::new("top");
        top.set_field(PASSWORD, "p1", true);
        top.snapshot();
        top.set_field(PASSWORD, "p2", true);
        top.set_field("Secret", "s1", true);
        tree.add_entry(root, top);

        let mut seen = Vec::new();
        let mapped = tree
            .map_protected(|v| {
                seen.push(v.to_string());
                Ok(v.to_uppercase())
            })
            .unwrap();

        assert_eq!(seen, vec!["p2", "s1", "p1", "p3"]);
        assert_eq!(mapped.entries()[0].password(), "P2");
        assert_eq!(mapped.entries()[0].history[0].password(), "P1");
        assert_eq!(mapped.entries()[0].title(), "top");
    }
}

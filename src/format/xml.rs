//! KeePass XML document <-> [`VaultTree`].
//!
//! The reader runs protected values through the inner stream cipher in
//! document order, whatever order a writer chose for entries and groups.
//! The writer takes values that are already protected (see
//! [`VaultTree::map_protected`]) and emits entries before child groups, so
//! its document order equals the tree's traversal order.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use uuid::Uuid;

use crate::error::KdbxError;
use crate::tree::{
    Association, AutoType, DeletedObject, Entry, Group, MemoryProtection, Meta, Str, Times,
    VaultTree,
};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

fn malformed(e: impl std::fmt::Display) -> KdbxError {
    KdbxError::MalformedDocument(e.to_string())
}

// ---- writing ----

struct XmlOut {
    w: Writer<Vec<u8>>,
}

impl XmlOut {
    fn event(&mut self, ev: Event<'_>) -> Result<(), KdbxError> {
        self.w.write_event(ev).map_err(malformed)
    }

    fn open(&mut self, name: &str) -> Result<(), KdbxError> {
        self.event(Event::Start(BytesStart::new(name)))
    }

    fn close(&mut self, name: &str) -> Result<(), KdbxError> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn leaf(&mut self, name: &str, text: &str) -> Result<(), KdbxError> {
        self.open(name)?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.close(name)
    }

    fn leaf_bool(&mut self, name: &str, v: bool) -> Result<(), KdbxError> {
        self.leaf(name, if v { "True" } else { "False" })
    }

    fn leaf_nullable(&mut self, name: &str, v: Option<bool>) -> Result<(), KdbxError> {
        match v {
            Some(v) => self.leaf_bool(name, v),
            None => self.leaf(name, "null"),
        }
    }

    fn leaf_uuid(&mut self, name: &str, uuid: &Uuid) -> Result<(), KdbxError> {
        self.leaf(name, &STANDARD.encode(uuid.as_bytes()))
    }

    fn leaf_time(&mut self, name: &str, t: &DateTime<Utc>) -> Result<(), KdbxError> {
        self.leaf(name, &t.format(TIME_FORMAT).to_string())
    }
}

/// Serializes the tree as a KeePass 2.x XML document.
pub fn write(tree: &VaultTree) -> Result<Vec<u8>, KdbxError> {
    let mut out = XmlOut {
        w: Writer::new(Vec::new()),
    };
    out.event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))?;
    out.open("KeePassFile")?;
    write_meta(&mut out, &tree.meta)?;
    out.open("Root")?;
    write_group(&mut out, tree.root())?;
    out.open("DeletedObjects")?;
    for d in &tree.deleted_objects {
        out.open("DeletedObject")?;
        out.leaf_uuid("UUID", &d.uuid)?;
        out.leaf_time("DeletionTime", &d.deletion_time)?;
        out.close("DeletedObject")?;
    }
    out.close("DeletedObjects")?;
    out.close("Root")?;
    out.close("KeePassFile")?;
    Ok(out.w.into_inner())
}

fn write_meta(out: &mut XmlOut, meta: &Meta) -> Result<(), KdbxError> {
    out.open("Meta")?;
    out.leaf("Generator", &meta.generator)?;
    if let Some(hash) = &meta.header_hash {
        out.leaf("HeaderHash", hash)?;
    }
    out.leaf("DatabaseName", &meta.database_name)?;
    out.leaf("DatabaseDescription", &meta.database_description)?;
    out.leaf("DefaultUserName", &meta.default_username)?;
    out.open("MemoryProtection")?;
    let mp = &meta.memory_protection;
    out.leaf_bool("ProtectTitle", mp.protect_title)?;
    out.leaf_bool("ProtectUserName", mp.protect_username)?;
    out.leaf_bool("ProtectPassword", mp.protect_password)?;
    out.leaf_bool("ProtectURL", mp.protect_url)?;
    out.leaf_bool("ProtectNotes", mp.protect_notes)?;
    out.close("MemoryProtection")?;
    out.leaf_bool("RecycleBinEnabled", meta.recycle_bin_enabled)?;
    out.leaf_uuid("RecycleBinUUID", &meta.recycle_bin_uuid)?;
    out.leaf("HistoryMaxItems", &meta.history_max_items.to_string())?;
    out.leaf("HistoryMaxSize", &meta.history_max_size.to_string())?;
    out.close("Meta")
}

fn write_times(out: &mut XmlOut, times: &Times) -> Result<(), KdbxError> {
    out.open("Times")?;
    out.leaf_time("CreationTime", &times.creation)?;
    out.leaf_time("LastModificationTime", &times.last_modification)?;
    out.leaf_time("LastAccessTime", &times.last_access)?;
    out.leaf_time("ExpiryTime", &times.expiry)?;
    out.leaf_bool("Expires", times.expires)?;
    out.leaf("UsageCount", &times.usage_count.to_string())?;
    out.leaf_time("LocationChanged", &times.location_changed)?;
    out.close("Times")
}

fn write_group(out: &mut XmlOut, group: &Group) -> Result<(), KdbxError> {
    out.open("Group")?;
    out.leaf_uuid("UUID", &group.uuid)?;
    out.leaf("Name", &group.name)?;
    out.leaf("Notes", &group.notes)?;
    out.leaf("IconID", &group.icon_id.to_string())?;
    write_times(out, &group.times)?;
    out.leaf_bool("IsExpanded", group.is_expanded)?;
    out.leaf("DefaultAutoTypeSequence", &group.default_auto_type_sequence)?;
    out.leaf_nullable("EnableAutoType", group.enable_auto_type)?;
    out.leaf_nullable("EnableSearching", group.enable_searching)?;
    out.leaf_uuid("LastTopVisibleEntry", &group.last_top_visible_entry)?;
    for entry in &group.entries {
        write_entry(out, entry)?;
    }
    for child in &group.groups {
        write_group(out, child)?;
    }
    out.close("Group")
}

fn write_entry(out: &mut XmlOut, entry: &Entry) -> Result<(), KdbxError> {
    out.open("Entry")?;
    out.leaf_uuid("UUID", &entry.uuid)?;
    out.leaf("IconID", &entry.icon_id.to_string())?;
    out.leaf("ForegroundColor", &entry.foreground_color)?;
    out.leaf("BackgroundColor", &entry.background_color)?;
    out.leaf("OverrideURL", &entry.override_url)?;
    out.leaf("Tags", &entry.tags)?;
    write_times(out, &entry.times)?;
    for s in &entry.strings {
        out.open("String")?;
        out.leaf("Key", &s.key)?;
        let mut value = BytesStart::new("Value");
        if s.protected {
            value.push_attribute(("Protected", "True"));
        }
        out.event(Event::Start(value))?;
        out.event(Event::Text(BytesText::new(&s.value)))?;
        out.close("Value")?;
        out.close("String")?;
    }
    write_auto_type(out, &entry.auto_type)?;
    if !entry.history.is_empty() {
        out.open("History")?;
        for h in &entry.history {
            write_entry(out, h)?;
        }
        out.close("History")?;
    }
    out.close("Entry")
}

fn write_auto_type(out: &mut XmlOut, at: &AutoType) -> Result<(), KdbxError> {
    out.open("AutoType")?;
    out.leaf_bool("Enabled", at.enabled)?;
    out.leaf(
        "DataTransferObfuscation",
        &at.data_transfer_obfuscation.to_string(),
    )?;
    if let Some(seq) = &at.default_sequence {
        out.leaf("DefaultSequence", seq)?;
    }
    for a in &at.associations {
        out.open("Association")?;
        out.leaf("Window", &a.window)?;
        out.leaf("KeystrokeSequence", &a.keystroke_sequence)?;
        out.close("Association")?;
    }
    out.close("AutoType")
}

// ---- reading ----

#[derive(Debug, Default)]
struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn from_start(e: &BytesStart<'_>) -> Result<Self, KdbxError> {
        let mut node = Node {
            name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
            ..Node::default()
        };
        for attr in e.attributes() {
            let attr = attr.map_err(malformed)?;
            node.attrs.push((
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                attr.unescape_value().map_err(malformed)?.into_owned(),
            ));
        }
        Ok(node)
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn require(&self, name: &str) -> Result<&Node, KdbxError> {
        self.child(name)
            .ok_or_else(|| malformed(format!("<{}> has no <{name}>", self.name)))
    }

    fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn text(&self, name: &str) -> String {
        self.child(name).map(|c| c.text.clone()).unwrap_or_default()
    }

    fn bool(&self, name: &str, default: bool) -> bool {
        match self.child(name).map(|c| c.text.as_str()) {
            Some(t) if t.eq_ignore_ascii_case("true") || t == "1" => true,
            Some(t) if t.eq_ignore_ascii_case("false") || t == "0" => false,
            _ => default,
        }
    }

    fn nullable(&self, name: &str) -> Option<bool> {
        match self.child(name).map(|c| c.text.as_str()) {
            Some(t) if t.eq_ignore_ascii_case("true") => Some(true),
            Some(t) if t.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    fn number<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, KdbxError> {
        match self.child(name).map(|c| c.text.trim()) {
            None | Some("") => Ok(default),
            Some(t) => t
                .parse()
                .map_err(|_| malformed(format!("<{name}> is not a number: {t}"))),
        }
    }

    fn uuid(&self, name: &str) -> Result<Uuid, KdbxError> {
        let text = self.text(name);
        let text = text.trim();
        if text.is_empty() {
            return Ok(Uuid::nil());
        }
        let bytes = STANDARD.decode(text)?;
        Uuid::from_slice(&bytes).map_err(malformed)
    }

    fn time(&self, name: &str) -> Result<DateTime<Utc>, KdbxError> {
        let text = self.text(name);
        let text = text.trim();
        if text.is_empty() {
            return Ok(DateTime::UNIX_EPOCH);
        }
        NaiveDateTime::parse_from_str(text, TIME_FORMAT)
            .map(|n| n.and_utc())
            .or_else(|_| DateTime::parse_from_rfc3339(text).map(|d| d.with_timezone(&Utc)))
            .map_err(|e| malformed(format!("<{name}> {text}: {e}")))
    }
}

fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => *root = Some(node),
    }
}

fn parse_dom(text: &str) -> Result<Node, KdbxError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Node> = Vec::new();
    let mut root = None;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => stack.push(Node::from_start(&e)?),
            Event::Empty(e) => {
                let node = Node::from_start(&e)?;
                attach(&mut stack, &mut root, node);
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?;
                attach(&mut stack, &mut root, node);
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape().map_err(malformed)?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(malformed("document ended inside an element"));
    }
    root.ok_or_else(|| malformed("empty document"))
}

fn unprotect_values<F>(node: &mut Node, f: &mut F) -> Result<(), KdbxError>
where
    F: FnMut(&str) -> Result<String, KdbxError>,
{
    let protected = node
        .attr("Protected")
        .is_some_and(|p| p.eq_ignore_ascii_case("true"));
    if node.name == "Value" && protected {
        node.text = f(&node.text)?;
    }
    for child in &mut node.children {
        unprotect_values(child, f)?;
    }
    Ok(())
}

/// Parses a KeePass XML document.
///
/// Every `<Value Protected="True">` is passed to `unprotect` in the order it
/// appears in the document, and the result becomes the stored value.
pub fn read<F>(document: &[u8], mut unprotect: F) -> Result<VaultTree, KdbxError>
where
    F: FnMut(&str) -> Result<String, KdbxError>,
{
    let text = std::str::from_utf8(document).map_err(malformed)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut doc = parse_dom(text)?;
    if doc.name != "KeePassFile" {
        return Err(malformed(format!("unexpected root <{}>", doc.name)));
    }
    unprotect_values(&mut doc, &mut unprotect)?;

    let meta = match doc.child("Meta") {
        Some(node) => read_meta(node)?,
        None => Meta::default(),
    };

    let root_node = doc.require("Root")?;
    let mut groups = root_node.children("Group");
    let root = read_group(
        groups
            .next()
            .ok_or_else(|| malformed("<Root> has no <Group>"))?,
    )?;
    if groups.next().is_some() {
        return Err(malformed("<Root> has more than one <Group>"));
    }

    let mut deleted = Vec::new();
    if let Some(node) = root_node.child("DeletedObjects") {
        for d in node.children("DeletedObject") {
            deleted.push(DeletedObject {
                uuid: d.uuid("UUID")?,
                deletion_time: d.time("DeletionTime")?,
            });
        }
    }

    Ok(VaultTree::from_parts(meta, root, deleted))
}

fn read_meta(node: &Node) -> Result<Meta, KdbxError> {
    let defaults = Meta::default();
    let memory_protection = match node.child("MemoryProtection") {
        Some(mp) => {
            let d = MemoryProtection::default();
            MemoryProtection {
                protect_title: mp.bool("ProtectTitle", d.protect_title),
                protect_username: mp.bool("ProtectUserName", d.protect_username),
                protect_password: mp.bool("ProtectPassword", d.protect_password),
                protect_url: mp.bool("ProtectURL", d.protect_url),
                protect_notes: mp.bool("ProtectNotes", d.protect_notes),
            }
        }
        None => MemoryProtection::default(),
    };
    Ok(Meta {
        generator: node.text("Generator"),
        header_hash: node.child("HeaderHash").map(|n| n.text.clone()),
        database_name: node.text("DatabaseName"),
        database_description: node.text("DatabaseDescription"),
        default_username: node.text("DefaultUserName"),
        memory_protection,
        recycle_bin_enabled: node.bool("RecycleBinEnabled", defaults.recycle_bin_enabled),
        recycle_bin_uuid: node.uuid("RecycleBinUUID")?,
        history_max_items: node.number("HistoryMaxItems", defaults.history_max_items)?,
        history_max_size: node.number("HistoryMaxSize", defaults.history_max_size)?,
    })
}

fn read_times(node: Option<&Node>) -> Result<Times, KdbxError> {
    let Some(node) = node else {
        return Ok(Times::now());
    };
    Ok(Times {
        creation: node.time("CreationTime")?,
        last_modification: node.time("LastModificationTime")?,
        last_access: node.time("LastAccessTime")?,
        expiry: node.time("ExpiryTime")?,
        expires: node.bool("Expires", false),
        usage_count: node.number("UsageCount", 0)?,
        location_changed: node.time("LocationChanged")?,
    })
}

fn read_group(node: &Node) -> Result<Group, KdbxError> {
    Ok(Group {
        uuid: node.uuid("UUID")?,
        name: node.text("Name"),
        notes: node.text("Notes"),
        icon_id: node.number("IconID", 0)?,
        times: read_times(node.child("Times"))?,
        is_expanded: node.bool("IsExpanded", true),
        default_auto_type_sequence: node.text("DefaultAutoTypeSequence"),
        enable_auto_type: node.nullable("EnableAutoType"),
        enable_searching: node.nullable("EnableSearching"),
        last_top_visible_entry: node.uuid("LastTopVisibleEntry")?,
        entries: node
            .children("Entry")
            .map(read_entry)
            .collect::<Result<_, _>>()?,
        groups: node
            .children("Group")
            .map(read_group)
            .collect::<Result<_, _>>()?,
    })
}

fn read_entry(node: &Node) -> Result<Entry, KdbxError> {
    let strings = node
        .children("String")
        .map(|s| {
            let value = s.child("Value");
            Str {
                key: s.text("Key"),
                value: value.map(|v| v.text.clone()).unwrap_or_default(),
                protected: value
                    .and_then(|v| v.attr("Protected"))
                    .is_some_and(|p| p.eq_ignore_ascii_case("true")),
            }
        })
        .collect();

    let auto_type = match node.child("AutoType") {
        Some(at) => AutoType {
            enabled: at.bool("Enabled", true),
            data_transfer_obfuscation: at.number("DataTransferObfuscation", 0)?,
            default_sequence: at.child("DefaultSequence").map(|n| n.text.clone()),
            associations: at
                .children("Association")
                .map(|a| Association {
                    window: a.text("Window"),
                    keystroke_sequence: a.text("KeystrokeSequence"),
                })
                .collect(),
        },
        None => AutoType::default(),
    };

    let history = match node.child("History") {
        Some(h) => h
            .children("Entry")
            .map(read_entry)
            .collect::<Result<_, _>>()?,
        None => Vec::new(),
    };

    Ok(Entry {
        uuid: node.uuid("UUID")?,
        icon_id: node.number("IconID", 0)?,
        foreground_color: node.text("ForegroundColor"),
        background_color: node.text("BackgroundColor"),
        override_url: node.text("OverrideURL"),
        tags: node.text("Tags"),
        times: read_times(node.child("Times"))?,
        strings,
        auto_type,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{PASSWORD, USERNAME};

    fn keep(v: &str) -> Result<String, KdbxError> {
        Ok(v.to_string())
    }

    fn sample() -> VaultTree {
        let mut tree = VaultTree::new("Personal");
        tree.meta.database_description = "cards & keys <main>".into();
        let root = tree.root().uuid;

        let mut web = Group::new("Web");
        web.enable_searching = Some(false);
        let web_id = web.uuid;
        tree.add_group(root, web);

        let mut mail = Entry::new("Mail");
        mail.set_field(USERNAME, "me@example.com", false);
        mail.set_field(PASSWORD, "c2VjcmV0", true);
        mail.auto_type.default_sequence = Some("{USERNAME}{TAB}{PASSWORD}{ENTER}".into());
        mail.auto_type.associations.push(Association {
            window: "Inbox*".into(),
            keystroke_sequence: String::new(),
        });
        mail.snapshot();
        mail.tags = "mail;work".into();
        tree.add_entry(web_id, mail);

        tree.add_entry(root, Entry::new("Bank"));
        let gone = Entry::new("Gone");
        let gone_id = gone.uuid;
        tree.add_entry(root, gone);
        tree.delete_entry(gone_id);
        assert_eq!(tree.deleted_objects.len(), 1);
        tree
    }

    #[test]
    fn document_roundtrip() {
        let tree = sample();
        let bytes = write(&tree).unwrap();
        let parsed = read(&bytes, keep).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn entries_precede_child_groups() {
        let bytes = write(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let bank = text.find("<Value>Bank</Value>").unwrap();
        let web = text.find("<Name>Web</Name>").unwrap();
        assert!(bank < web);
    }

    #[test]
    fn protected_values_are_flagged_and_untouched() {
        let bytes = write(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains(r#"<Value Protected="True">c2VjcmV0</Value>"#));

        let parsed = read(text.as_bytes(), keep).unwrap();
        let mail = &parsed.root().groups[0].entries[0];
        assert_eq!(mail.password(), "c2VjcmV0");
        assert!(mail.strings.iter().any(|s| s.key == PASSWORD && s.protected));
    }

    #[test]
    fn reads_keepass_style_document() {
        let doc = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<KeePassFile>
	<Meta>
		<Generator>KeePass</Generator>
		<HeaderHash>abc=</HeaderHash>
	</Meta>
	<Root>
		<Group>
			<UUID>AAAAAAAAAAAAAAAAAAAAAQ==</UUID>
			<Name>Root</Name>
			<Times>
				<CreationTime>2019-03-01T10:00:00Z</CreationTime>
			</Times>
			<EnableAutoType>null</EnableAutoType>
			<Entry>
				<UUID>AAAAAAAAAAAAAAAAAAAAAg==</UUID>
				<String><Key>Title</Key><Value>Router &amp; Modem</Value></String>
				<String><Key>Password</Key><Value Protected="True" /></String>
			</Entry>
		</Group>
		<DeletedObjects />
	</Root>
</KeePassFile>"#;

        let tree = read(doc.as_bytes(), keep).unwrap();
        assert_eq!(tree.meta.generator, "KeePass");
        assert_eq!(tree.meta.header_hash.as_deref(), Some("abc="));
        assert_eq!(tree.root().name, "Root");
        assert_eq!(tree.root().enable_auto_type, None);
        assert_eq!(
            tree.root().times.creation.format(TIME_FORMAT).to_string(),
            "2019-03-01T10:00:00Z"
        );

        let entry = &tree.root().entries[0];
        assert_eq!(entry.uuid, Uuid::from_u128(2));
        assert_eq!(entry.title(), "Router & Modem");
        assert_eq!(entry.password(), "");
        assert!(entry.strings[1].protected);
    }

    #[test]
    fn protected_values_are_visited_in_document_order() {
        let doc = r#"<KeePassFile><Root><Group>
            <Name>Root</Name>
            <Group>
                <Name>Inner</Name>
                <Entry><String><Key>Password</Key><Value Protected="True">a</Value></String></Entry>
            </Group>
            <Entry>
                <String><Key>Title</Key><Value>plain</Value></String>
                <String><Key>Password</Key><Value Protected="True">b</Value></String>
                <History>
                    <Entry><String><Key>Password</Key><Value Protected="True">c</Value></String></Entry>
                </History>
            </Entry>
        </Group></Root></KeePassFile>"#;

        let mut seen = Vec::new();
        let tree = read(doc.as_bytes(), |v| {
            seen.push(v.to_string());
            Ok(format!("{v}{}", seen.len()))
        })
        .unwrap();

        assert_eq!(seen, ["a", "b", "c"]);
        assert_eq!(tree.root().groups[0].entries[0].password(), "a1");
        let entry = &tree.root().entries[0];
        assert_eq!(entry.title(), "plain");
        assert_eq!(entry.password(), "b2");
        assert_eq!(entry.history[0].password(), "c3");
    }

    #[test]
    fn bad_documents_are_malformed() {
        for doc in [
            "<Other/>",
            "<KeePassFile><Root></Root></KeePassFile>",
            "<KeePassFile><Root><Group><IconID>x</IconID></Group></Root></KeePassFile>",
            "<KeePassFile><Root><Group>",
        ] {
            assert!(
                matches!(read(doc.as_bytes(), keep), Err(KdbxError::MalformedDocument(_))),
                "{doc}"
            );
        }
    }
}

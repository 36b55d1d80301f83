//! Display ordering for VMs and teardown resources.
//!
//! Behavior tags look like `B3a.llama`: a family code (`BC`, `SC`, `C`,
//! `M`, `B`, `S`), a numeric version, then a free-form variant.

pub const UNRANKED: u8 = 99;

const FAMILIES: [(&str, u8); 6] = [
    ("BC", 3),
    ("SC", 5),
    ("C", 0),
    ("M", 1),
    ("B", 2),
    ("S", 4),
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    pub category: u8,
    pub version: u32,
    pub variant: String,
    pub instance: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorParts<'a> {
    pub family: &'a str,
    pub category: u8,
    pub version: u32,
    pub variant: &'a str,
}

/// Splits a behavior tag into family, version and variant. Two-letter
/// families are tried first so `BC1` is not read as `B`.
pub fn parse_behavior(tag: &str) -> Option<BehaviorParts<'_>> {
    let (family, category) = FAMILIES
        .iter()
        .find(|(family, _)| tag.starts_with(family))
        .copied()?;
    let rest = &tag[family.len()..];
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let version = rest[..digits].parse().unwrap_or(u32::MAX);
    Some(BehaviorParts {
        family,
        category,
        version,
        variant: &rest[digits..],
    })
}

/// Trailing numeric segment of an entity name (`sup-M1-2` has index 2).
pub fn instance_index(name: &str) -> u32 {
    name.rsplit('-')
        .next()
        .and_then(|segment| segment.parse().ok())
        .unwrap_or(0)
}

pub fn sort_key(name: &str, behavior: &str) -> SortKey {
    let derived;
    let behavior = if behavior.is_empty() {
        derived = behavior_from_name(name).unwrap_or_default();
        derived.as_str()
    } else {
        behavior
    };
    let (category, version, variant) = match parse_behavior(behavior) {
        Some(parts) => (parts.category, parts.version, parts.variant.to_owned()),
        None => (UNRANKED, 0, behavior.to_owned()),
    };
    SortKey {
        category,
        version,
        variant,
        instance: instance_index(name),
        name: name.to_owned(),
    }
}

/// Recovers a behavior tag from an entity name such as `exp-B3a-llama-0`.
/// The first segment after the prefix that parses as a behavior starts
/// the tag, and a trailing numeric segment is the instance index.
pub fn behavior_from_name(name: &str) -> Option<String> {
    let segments = name.split('-').skip(1).collect::<Vec<&str>>();
    let start = segments
        .iter()
        .position(|segment| parse_behavior(segment).is_some())?;
    let mut end = segments.len();
    if end > start + 1 && segments[end - 1].bytes().all(|byte| byte.is_ascii_digit()) {
        end -= 1;
    }
    Some(segments[start..end].join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_family_then_version_variant_and_instance() {
        let mut names = vec!["exp-S2-gemma-1", "exp-B3a-llama-0", "exp-M1-2"];
        names.sort_by_key(|name| sort_key(name, ""));
        assert_eq!(names, vec!["exp-M1-2", "exp-B3a-llama-0", "exp-S2-gemma-1"]);

        let mut tags = vec![
            ("sup-B10-0", "B10"),
            ("sup-B2b-0", "B2b"),
            ("sup-B2a-1", "B2a"),
            ("sup-B2a-0", "B2a"),
            ("sup-C0-0", "C0"),
            ("sup-SC1-0", "SC1"),
            ("sup-BC1-0", "BC1"),
            ("node-x", "weird"),
        ];
        tags.sort_by_key(|(name, behavior)| sort_key(name, behavior));
        let ordered = tags.iter().map(|(name, _)| *name).collect::<Vec<&str>>();
        assert_eq!(
            ordered,
            vec![
                "sup-C0-0",
                "sup-B2a-0",
                "sup-B2a-1",
                "sup-B2b-0",
                "sup-B10-0",
                "sup-BC1-0",
                "sup-SC1-0",
                "node-x",
            ]
        );
    }

    #[test]
    fn parses_two_letter_families_first() {
        let parts = parse_behavior("BC3x.llama").expect("parts");
        assert_eq!(parts.family, "BC");
        assert_eq!(parts.category, 3);
        assert_eq!(parts.version, 3);
        assert_eq!(parts.variant, "x.llama");
        assert_eq!(parse_behavior("Bx"), None);
        assert_eq!(parse_behavior("llama"), None);
    }

    #[test]
    fn derives_behavior_from_discovered_names() {
        assert_eq!(behavior_from_name("exp-B3a-llama-0").as_deref(), Some("B3a.llama"));
        assert_eq!(behavior_from_name("sup-M1-0").as_deref(), Some("M1"));
        assert_eq!(behavior_from_name("sup-run7-S2-gemma-4").as_deref(), Some("S2.gemma"));
        assert_eq!(behavior_from_name("sup-web-0"), None);
        assert_eq!(instance_index("sup-M1-12"), 12);
        assert_eq!(instance_index("sup-M1"), 0);
    }
}

//! Ordered class list: index, title and display color per class.

use crate::colors::{parse_color, to_hex};
use data_contracts::{ClassBlock, ConfigError};
use std::collections::HashMap;

/// Label tensors store class indices as `u8`.
pub const MAX_CLASSES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub index: u8,
    pub title: String,
    pub color: [u8; 3],
    pub query: Option<String>,
}

/// A raw label pixel as found in a label raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelValue {
    Rgb([u8; 3]),
    Raw(u32),
}

impl std::fmt::Display for LabelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelValue::Rgb(rgb) => f.write_str(&to_hex(*rgb)),
            LabelValue::Raw(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassRegistry {
    classes: Vec<ClassDef>,
    by_color: HashMap<[u8; 3], u8>,
}

impl ClassRegistry {
    pub fn build(blocks: &[ClassBlock]) -> Result<Self, ConfigError> {
        if blocks.is_empty() {
            return Err(ConfigError::invalid("classes", "at least one class is required"));
        }
        if blocks.len() > MAX_CLASSES {
            return Err(ConfigError::invalid(
                "classes",
                format!("{} classes declared, at most {MAX_CLASSES} supported", blocks.len()),
            ));
        }
        let mut classes = Vec::with_capacity(blocks.len());
        let mut by_color = HashMap::with_capacity(blocks.len());
        let mut titles: HashMap<&str, usize> = HashMap::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            let section = format!("classes[{i}]");
            let title = block.title.trim();
            if title.is_empty() {
                return Err(ConfigError::invalid(section, "title is empty"));
            }
            if let Some(first) = titles.insert(title, i) {
                return Err(ConfigError::invalid(
                    section,
                    format!("title {title:?} already used by classes[{first}]"),
                ));
            }
            let color = parse_color(&block.color).ok_or_else(|| {
                ConfigError::invalid(
                    section.clone(),
                    format!("color {:?} is neither a known name nor #RRGGBB", block.color),
                )
            })?;
            let index = i as u8;
            if let Some(first) = by_color.insert(color, index) {
                return Err(ConfigError::invalid(
                    section,
                    format!("color {} already used by classes[{first}]", to_hex(color)),
                ));
            }
            classes.push(ClassDef {
                index,
                title: title.to_string(),
                color,
                query: block.query.clone(),
            });
        }
        Ok(Self { classes, by_color })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn color_of(&self, index: u8) -> Option<[u8; 3]> {
        self.classes.get(index as usize).map(|c| c.color)
    }

    pub fn title_of(&self, index: u8) -> Option<&str> {
        self.classes.get(index as usize).map(|c| c.title.as_str())
    }

    /// Class index for a raw label pixel; `None` for anything not configured.
    pub fn index_of(&self, value: LabelValue) -> Option<u8> {
        match value {
            LabelValue::Rgb(rgb) => self.by_color.get(&rgb).copied(),
            LabelValue::Raw(v) => {
                let v = usize::try_from(v).ok()?;
                (v < self.classes.len()).then_some(v as u8)
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(title: &str, color: &str) -> ClassBlock {
        ClassBlock {
            title: title.into(),
            color: color.into(),
            query: None,
        }
    }

    #[test]
    fn indices_follow_declaration_order() {
        let reg = ClassRegistry::build(&[block("background", "white"), block("building", "#ff1493")])
            .unwrap();
        assert_eq!(reg.num_classes(), 2);
        assert_eq!(reg.title_of(1), Some("building"));
        assert_eq!(reg.color_of(0), Some([255, 255, 255]));
        assert_eq!(reg.color_of(2), None);
    }

    #[test]
    fn index_of_is_defined_for_exactly_the_configured_values() {
        let reg = ClassRegistry::build(&[
            block("background", "black"),
            block("building", "red"),
            block("road", "yellow"),
        ])
        .unwrap();
        for i in 0..3u32 {
            assert_eq!(reg.index_of(LabelValue::Raw(i)), Some(i as u8));
        }
        assert_eq!(reg.index_of(LabelValue::Raw(3)), None);
        assert_eq!(reg.index_of(LabelValue::Raw(u32::MAX)), None);
        assert_eq!(reg.index_of(LabelValue::Rgb([255, 0, 0])), Some(1));
        assert_eq!(reg.index_of(LabelValue::Rgb([255, 255, 0])), Some(2));
        assert_eq!(reg.index_of(LabelValue::Rgb([1, 2, 3])), None);
    }

    #[test]
    fn duplicate_titles_are_fatal() {
        let err = ClassRegistry::build(&[block("building", "red"), block("building", "blue")])
            .unwrap_err();
        match err {
            ConfigError::Invalid { section, msg } => {
                assert_eq!(section, "classes[1]");
                assert!(msg.contains("building"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_list_unknown_color_and_shared_color_are_fatal() {
        assert!(ClassRegistry::build(&[]).is_err());
        assert!(ClassRegistry::build(&[block("a", "reddish")]).is_err());
        assert!(ClassRegistry::build(&[block("a", "red"), block("b", "#ff0000")]).is_err());
    }
}

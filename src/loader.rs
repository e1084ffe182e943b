//! Program loader.
//!
//! Programs are XML documents: a tree of node elements (`sequence`,
//! `markov`, `one`, `all`, `prl`, `path`, `convolution`, ...) with `rule`,
//! `field`, `observe` and `union` children. The loader parses the document
//! into an element tree, builds the grid from the root's `values` alphabet,
//! and constructs the node tree with every rule expanded over its symmetry
//! subgroup.
//!
//! A malformed program refuses to start: every error names the offending
//! element and what was wrong with it.

use super::all_node::AllNode;
use super::convolution_node::{ConvolutionNode, ConvolutionRule};
use super::field::Field;
use super::node::{MarkovNode, Node, SequenceNode};
use super::observation::Observation;
use super::one_node::OneNode;
use super::parallel_node::ParallelNode;
use super::path_node::PathNode;
use super::rule::Rule;
use super::rule_node::RuleNodeData;
use super::symmetry::{cube_symmetries, full_symmetry_mask, square_symmetries, symmetry_mask};
use super::Grid;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::fmt;

/// Error type for program loading.
#[derive(Debug, Clone)]
pub enum LoadError {
    /// Malformed XML
    Xml(String),
    /// A required attribute is missing
    MissingAttribute { element: String, attribute: String },
    /// An attribute value failed to parse or validate
    InvalidAttribute {
        element: String,
        attribute: String,
        value: String,
        reason: String,
    },
    /// Element name is not a known node kind
    UnknownElement(String),
    /// Element is recognised but not loadable in this engine
    UnsupportedElement { element: String, reason: String },
    /// Symmetry subgroup name unknown in this dimensionality
    UnknownSymmetry(String),
    /// A rule pattern failed to parse
    Rule { element: String, message: String },
    /// A symbol is not declared in the grid alphabet
    UnknownSymbol { symbol: char, context: String },
    /// Grid construction failed
    Grid(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Xml(msg) => write!(f, "XML error: {}", msg),
            LoadError::MissingAttribute { element, attribute } => {
                write!(f, "missing attribute '{}' in <{}>", attribute, element)
            }
            LoadError::InvalidAttribute {
                element,
                attribute,
                value,
                reason,
            } => write!(
                f,
                "invalid value '{}' for attribute '{}' in <{}>: {}",
                value, attribute, element, reason
            ),
            LoadError::UnknownElement(name) => write!(f, "unknown element <{}>", name),
            LoadError::UnsupportedElement { element, reason } => {
                write!(f, "unsupported element <{}>: {}", element, reason)
            }
            LoadError::UnknownSymmetry(name) => write!(f, "unknown symmetry '{}'", name),
            LoadError::Rule { element, message } => {
                write!(f, "bad rule in <{}>: {}", element, message)
            }
            LoadError::UnknownSymbol { symbol, context } => {
                write!(f, "unknown symbol '{}' in {}", symbol, context)
            }
            LoadError::Grid(msg) => write!(f, "grid error: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

/// Node element names the loader understands.
const NODE_NAMES: &[&str] = &[
    "one",
    "all",
    "prl",
    "markov",
    "sequence",
    "path",
    "convolution",
    "convchain",
    "overlap",
    "map",
];

/// A loaded program, ready to hand to the interpreter.
pub struct LoadedProgram {
    pub root: Box<dyn Node>,
    pub grid: Grid,
    pub origin: bool,
}

impl fmt::Debug for LoadedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedProgram")
            .field("grid", &(self.grid.mx, self.grid.my, self.grid.mz))
            .field("origin", &self.origin)
            .finish()
    }
}

/// Minimal element tree the node factory walks.
struct Elem {
    name: String,
    attrs: HashMap<String, String>,
    children: Vec<Elem>,
}

impl Elem {
    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Elem> {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }

    fn require(&self, name: &str) -> Result<&str, LoadError> {
        self.attr(name).ok_or_else(|| LoadError::MissingAttribute {
            element: self.name.clone(),
            attribute: name.to_string(),
        })
    }

    fn bool_attr(&self, name: &str) -> bool {
        self.attr(name)
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn parse_attr<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, LoadError> {
        match self.attr(name) {
            None => Ok(default),
            Some(s) => s.parse().map_err(|_| LoadError::InvalidAttribute {
                element: self.name.clone(),
                attribute: name.to_string(),
                value: s.to_string(),
                reason: "not a valid number".to_string(),
            }),
        }
    }
}

fn element_from(e: &BytesStart) -> Result<Elem, LoadError> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|err| LoadError::Xml(format!("element name is not UTF-8: {}", err)))?
        .to_string();

    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| LoadError::Xml(err.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| LoadError::Xml(format!("attribute name is not UTF-8: {}", err)))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| LoadError::Xml(err.to_string()))?
            .to_string();
        attrs.insert(key, value);
    }

    Ok(Elem {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn parse_document(xml: &str) -> Result<Elem, LoadError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Elem> = Vec::new();
    let mut root: Option<Elem> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(element_from(&e)?),
            Ok(Event::Empty(e)) => {
                let elem = element_from(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(elem),
                    None if root.is_none() => root = Some(elem),
                    None => return Err(LoadError::Xml("multiple root elements".to_string())),
                }
            }
            Ok(Event::End(_)) => {
                let elem = stack
                    .pop()
                    .ok_or_else(|| LoadError::Xml("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(elem),
                    None if root.is_none() => root = Some(elem),
                    None => return Err(LoadError::Xml("multiple root elements".to_string())),
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(LoadError::Xml(e.to_string())),
        }
    }

    root.ok_or_else(|| LoadError::Xml("empty document".to_string()))
}

/// Load a program from XML. Grid dimensions of 0 fall back to 16x16x1.
pub fn load_program(
    xml: &str,
    mx: usize,
    my: usize,
    mz: usize,
) -> Result<LoadedProgram, LoadError> {
    let root_elem = parse_document(xml)?;

    if !NODE_NAMES.contains(&root_elem.name.as_str()) {
        return Err(LoadError::UnknownElement(root_elem.name));
    }

    let mx = if mx > 0 { mx } else { 16 };
    let my = if my > 0 { my } else { 16 };
    let mz = if mz > 0 { mz } else { 1 };

    let values = root_elem.require("values")?;
    let origin = root_elem.bool_attr("origin");

    let mut grid = Grid::try_with_alphabet(mx, my, mz, values)
        .map_err(|e| LoadError::Grid(e.to_string()))?;

    for union in root_elem.children_named("union") {
        let symbol_str = union.require("symbol")?;
        let symbol = symbol_str
            .chars()
            .next()
            .ok_or_else(|| LoadError::MissingAttribute {
                element: "union".to_string(),
                attribute: "symbol".to_string(),
            })?;
        let members = union.require("values")?;
        for ch in members.chars() {
            if !grid.values.contains_key(&ch) {
                return Err(LoadError::UnknownSymbol {
                    symbol: ch,
                    context: "union values".to_string(),
                });
            }
        }
        grid.add_union(symbol, members)
            .map_err(|e| LoadError::Grid(e.to_string()))?;
    }

    let is_2d = mz == 1;
    let symmetry = match root_elem.attr("symmetry") {
        Some(s) => symmetry_mask(is_2d, s).ok_or_else(|| LoadError::UnknownSymmetry(s.to_string()))?,
        None => full_symmetry_mask(is_2d),
    };

    let node = build_node(&root_elem, &grid, &symmetry)?;
    let root: Box<dyn Node> = match root_elem.name.as_str() {
        "markov" | "sequence" => node,
        // a bare rewrite node retries until exhaustion
        _ => Box::new(MarkovNode::new(vec![node])),
    };

    log::debug!(
        "loaded program: root <{}>, grid {}x{}x{}, {} values",
        root_elem.name,
        mx,
        my,
        mz,
        grid.c
    );

    Ok(LoadedProgram { root, grid, origin })
}

fn build_node(
    elem: &Elem,
    grid: &Grid,
    parent_symmetry: &[bool],
) -> Result<Box<dyn Node>, LoadError> {
    let is_2d = grid.mz == 1;
    let symmetry = match elem.attr("symmetry") {
        Some(s) => symmetry_mask(is_2d, s).ok_or_else(|| LoadError::UnknownSymmetry(s.to_string()))?,
        None => parent_symmetry.to_vec(),
    };

    match elem.name.as_str() {
        "markov" | "sequence" => {
            let mut children: Vec<Box<dyn Node>> = Vec::new();
            for child in &elem.children {
                if child.name == "union" {
                    continue;
                }
                if !NODE_NAMES.contains(&child.name.as_str()) {
                    return Err(LoadError::UnknownElement(child.name.clone()));
                }
                children.push(build_node(child, grid, &symmetry)?);
            }
            if elem.name == "markov" {
                Ok(Box::new(MarkovNode::new(children)))
            } else {
                Ok(Box::new(SequenceNode::new(children)))
            }
        }
        "one" | "all" | "prl" => build_rewrite_node(elem, grid, &symmetry),
        "path" => build_path_node(elem, grid),
        "convolution" => build_convolution_node(elem, grid),
        "convchain" | "overlap" => Err(LoadError::UnsupportedElement {
            element: elem.name.clone(),
            reason: "requires external sample assets".to_string(),
        }),
        "map" => Err(LoadError::UnsupportedElement {
            element: elem.name.clone(),
            reason: "grid remapping is outside this engine".to_string(),
        }),
        other => Err(LoadError::UnknownElement(other.to_string())),
    }
}

fn build_rewrite_node(
    elem: &Elem,
    grid: &Grid,
    symmetry: &[bool],
) -> Result<Box<dyn Node>, LoadError> {
    let rules = load_rule_set(elem, grid, symmetry)?;
    let grid_size = grid.state.len();

    let steps: usize = elem.parse_attr("steps", 0)?;
    let temperature: f64 = elem.parse_attr("temperature", 0.0)?;

    let fields = load_fields(elem, grid)?;
    let observations = load_observations(elem, grid)?;

    if elem.name == "prl" {
        if fields.is_some() || observations.is_some() {
            return Err(LoadError::UnsupportedElement {
                element: elem.name.clone(),
                reason: "fields and observations apply to <one> and <all> only".to_string(),
            });
        }
        let mut data = RuleNodeData::new(rules, grid_size);
        data.steps = steps;
        return Ok(Box::new(ParallelNode::with_data(data)));
    }

    let mut data = match fields {
        Some(fields) => RuleNodeData::with_fields(rules, grid_size, fields, temperature),
        None => {
            let mut data = RuleNodeData::new(rules, grid_size);
            data.temperature = temperature;
            data
        }
    };
    data.steps = steps;

    // search knobs may sit on the node or on an observe child
    let observe_search = elem
        .children_named("observe")
        .find(|o| o.attr("search").is_some());
    let search = elem.bool_attr("search")
        || observe_search.map(|o| o.bool_attr("search")).unwrap_or(false);
    if search {
        let limit: i32 = search_attr(elem, observe_search, "limit", 0)?;
        let depth_coefficient: f64 = search_attr(elem, observe_search, "depthCoefficient", 0.0)?;
        let tries: usize = search_attr(elem, observe_search, "tries", 0)?;
        data.set_search(limit, depth_coefficient, tries);
    }
    if let Some(observations) = observations {
        data.set_observations(observations, grid_size, grid.c as usize);
    }

    match elem.name.as_str() {
        "one" => Ok(Box::new(OneNode { data })),
        "all" => Ok(Box::new(AllNode { data })),
        _ => unreachable!("checked above"),
    }
}

fn search_attr<T: std::str::FromStr>(
    elem: &Elem,
    observe: Option<&Elem>,
    name: &str,
    default: T,
) -> Result<T, LoadError> {
    if elem.attr(name).is_some() {
        elem.parse_attr(name, default)
    } else if let Some(observe) = observe {
        observe.parse_attr(name, default)
    } else {
        Ok(default)
    }
}

fn load_rule_set(elem: &Elem, grid: &Grid, symmetry: &[bool]) -> Result<Vec<Rule>, LoadError> {
    let is_2d = grid.mz == 1;
    let mut rules = Vec::new();

    let rule_elems: Vec<&Elem> = elem.children_named("rule").collect();
    if rule_elems.is_empty() {
        // inline rule on the node element itself
        let rule = rule_from_attrs(elem, grid)?;
        rules.extend(expand_rule(rule, is_2d, symmetry));
    } else {
        for rule_elem in rule_elems {
            let mask = match rule_elem.attr("symmetry") {
                Some(s) => symmetry_mask(is_2d, s)
                    .ok_or_else(|| LoadError::UnknownSymmetry(s.to_string()))?,
                None => symmetry.to_vec(),
            };
            let rule = rule_from_attrs(rule_elem, grid)?;
            rules.extend(expand_rule(rule, is_2d, &mask));
        }
    }

    Ok(rules)
}

fn rule_from_attrs(elem: &Elem, grid: &Grid) -> Result<Rule, LoadError> {
    let input = elem.require("in")?;
    let output = elem.require("out")?;
    let mut rule = Rule::parse(input, output, grid).map_err(|e| LoadError::Rule {
        element: elem.name.clone(),
        message: e.to_string(),
    })?;
    rule.p = elem.parse_attr("p", 1.0)?;
    Ok(rule)
}

fn expand_rule(rule: Rule, is_2d: bool, mask: &[bool]) -> Vec<Rule> {
    if is_2d {
        square_symmetries(&rule, mask)
    } else {
        cube_symmetries(&rule, mask)
    }
}

fn load_fields(elem: &Elem, grid: &Grid) -> Result<Option<Vec<Option<Field>>>, LoadError> {
    let mut fields: Vec<Option<Field>> = vec![None; grid.c as usize];
    let mut any = false;

    for field_elem in elem.children_named("field") {
        let for_str = field_elem.require("for")?;
        let for_char = for_str.chars().next().unwrap_or(' ');
        let value = *grid
            .values
            .get(&for_char)
            .ok_or_else(|| LoadError::UnknownSymbol {
                symbol: for_char,
                context: "field 'for'".to_string(),
            })?;

        let substrate = grid.wave(field_elem.require("on")?);
        let (inversed, zero) = match field_elem.attr("from") {
            Some(from) => (true, grid.wave(from)),
            None => (false, grid.wave(field_elem.require("to")?)),
        };

        let mut field = Field::new(substrate, zero);
        field.inversed = inversed;
        field.recompute = field_elem.bool_attr("recompute");
        field.essential = field_elem.bool_attr("essential");

        fields[value as usize] = Some(field);
        any = true;
    }

    Ok(any.then_some(fields))
}

fn load_observations(
    elem: &Elem,
    grid: &Grid,
) -> Result<Option<Vec<Option<Observation>>>, LoadError> {
    let mut observations: Vec<Option<Observation>> = vec![None; grid.c as usize];
    let mut any = false;

    for obs_elem in elem.children_named("observe") {
        let value_str = obs_elem.require("value")?;
        let value_char = value_str.chars().next().unwrap_or(' ');
        let value = *grid
            .values
            .get(&value_char)
            .ok_or_else(|| LoadError::UnknownSymbol {
                symbol: value_char,
                context: "observe 'value'".to_string(),
            })?;

        let from_char = obs_elem
            .attr("from")
            .and_then(|s| s.chars().next())
            .unwrap_or(value_char);
        let to = obs_elem.require("to")?;

        let observation =
            Observation::new(from_char, to, grid).ok_or_else(|| LoadError::UnknownSymbol {
                symbol: from_char,
                context: "observe 'from'".to_string(),
            })?;

        observations[value as usize] = Some(observation);
        any = true;
    }

    Ok(any.then_some(observations))
}

fn build_path_node(elem: &Elem, grid: &Grid) -> Result<Box<dyn Node>, LoadError> {
    let from = elem.require("from")?;
    let to = elem.require("to")?;
    let on = elem.require("on")?;

    let start = grid.wave(from);
    let finish = grid.wave(to);
    let substrate = grid.wave(on);

    let color_char = elem
        .attr("color")
        .and_then(|s| s.chars().next())
        .or_else(|| from.chars().next())
        .unwrap_or(' ');
    let value = *grid
        .values
        .get(&color_char)
        .ok_or_else(|| LoadError::UnknownSymbol {
            symbol: color_char,
            context: "path color".to_string(),
        })?;

    let mut node = PathNode::new(start, finish, substrate, value);
    node.inertia = elem.bool_attr("inertia");
    node.longest = elem.bool_attr("longest");
    node.edges = elem.bool_attr("edges");
    node.vertices = elem.bool_attr("vertices");
    Ok(Box::new(node))
}

fn build_convolution_node(elem: &Elem, grid: &Grid) -> Result<Box<dyn Node>, LoadError> {
    let neighborhood = elem.require("neighborhood")?;
    let periodic = elem.bool_attr("periodic");
    let steps: usize = elem.parse_attr("steps", 0)?;

    let mut rules = Vec::new();
    for rule_elem in elem.children_named("rule") {
        let input = single_value(rule_elem, "in", grid)?;
        let output = single_value(rule_elem, "out", grid)?;

        let mut rule = match (rule_elem.attr("values"), rule_elem.attr("sum")) {
            (Some(values), Some(sum)) => {
                let mut counted = Vec::new();
                for ch in values.chars() {
                    let v = *grid
                        .values
                        .get(&ch)
                        .ok_or_else(|| LoadError::UnknownSymbol {
                            symbol: ch,
                            context: "convolution rule 'values'".to_string(),
                        })?;
                    counted.push(v);
                }
                ConvolutionRule::with_sums(
                    input,
                    output,
                    counted,
                    ConvolutionRule::parse_sum_intervals(sum),
                )
            }
            (None, None) => ConvolutionRule::new(input, output),
            _ => {
                return Err(LoadError::InvalidAttribute {
                    element: rule_elem.name.clone(),
                    attribute: "sum".to_string(),
                    value: String::new(),
                    reason: "'values' and 'sum' must be given together".to_string(),
                })
            }
        };
        rule.p = rule_elem.parse_attr("p", 1.0)?;
        rules.push(rule);
    }

    if rules.is_empty() {
        return Err(LoadError::MissingAttribute {
            element: elem.name.clone(),
            attribute: "rule children".to_string(),
        });
    }

    let mut node = ConvolutionNode::with_kernel(
        rules,
        neighborhood,
        periodic,
        grid.state.len(),
        grid.c as usize,
        grid.mz == 1,
    )
    .ok_or_else(|| LoadError::InvalidAttribute {
        element: elem.name.clone(),
        attribute: "neighborhood".to_string(),
        value: neighborhood.to_string(),
        reason: "unknown neighborhood name".to_string(),
    })?;
    node.steps = steps;
    Ok(Box::new(node))
}

fn single_value(elem: &Elem, attribute: &str, grid: &Grid) -> Result<u8, LoadError> {
    let s = elem.require(attribute)?;
    let ch = s.chars().next().unwrap_or(' ');
    grid.values
        .get(&ch)
        .copied()
        .ok_or_else(|| LoadError::UnknownSymbol {
            symbol: ch,
            context: format!("<{}> '{}'", elem.name, attribute),
        })
}

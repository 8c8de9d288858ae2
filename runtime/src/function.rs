//! Function identities, node attributes and the cluster function library.
//!
//! A cluster is represented as a [`FunctionDef`]: a straight-line program over
//! the node's inputs. Nodes refer to it by [`FunctionSpec`], whose canonical
//! rendering is part of every compilation signature.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use kiln_dtype::DType;
use smallvec::{SmallVec, smallvec};

/// Attribute value attached to a node or a function reference.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Bool(bool),
    Str(String),
    DType(DType),
    DTypeList(Vec<DType>),
    Shape(Vec<usize>),
    Func(FunctionSpec),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::DType(v) => write!(f, "{v}"),
            Self::DTypeList(list) => {
                write!(f, "[")?;
                for (i, dtype) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{dtype}")?;
                }
                write!(f, "]")
            }
            Self::Shape(dims) => write!(f, "{dims:?}"),
            Self::Func(function) => write!(f, "{function}"),
        }
    }
}

/// Reference to a library function plus the attributes it is instantiated with.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), attrs: BTreeMap::new() }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// `name[k1=v1,k2=v2]` with keys sorted; just `name` without attributes.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.attrs.is_empty() {
            return Ok(());
        }
        write!(f, "[")?;
        for (i, (key, value)) in self.attrs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, "]")
    }
}

/// Elementwise primitives a cluster body may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Primitive {
    Identity,
    Neg,
    Add,
    Sub,
    Mul,
}

impl Primitive {
    pub fn arity(&self) -> usize {
        match self {
            Self::Identity | Self::Neg => 1,
            Self::Add | Self::Sub | Self::Mul => 2,
        }
    }
}

/// Operand of an instruction or a function result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRef {
    /// The node input at this index.
    Arg(usize),
    /// The result of the instruction at this index.
    Node(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Primitive,
    pub operands: SmallVec<[ValueRef; 2]>,
}

/// Straight-line cluster body.
///
/// Arguments are the node inputs in order (`[constants..., args..., resources...]`);
/// a resource argument reads the variable's current value.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub num_args: usize,
    pub body: Vec<Instruction>,
    pub outputs: Vec<ValueRef>,
    /// New values for resource arguments, as `(argument index, value)`.
    pub resource_updates: Vec<(usize, ValueRef)>,
}

impl FunctionDef {
    pub fn new(name: impl Into<String>, num_args: usize) -> Self {
        Self { name: name.into(), num_args, body: Vec::new(), outputs: Vec::new(), resource_updates: Vec::new() }
    }

    pub fn unary(&mut self, op: Primitive, operand: ValueRef) -> ValueRef {
        self.push(op, smallvec![operand])
    }

    pub fn binary(&mut self, op: Primitive, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.push(op, smallvec![lhs, rhs])
    }

    fn push(&mut self, op: Primitive, operands: SmallVec<[ValueRef; 2]>) -> ValueRef {
        self.body.push(Instruction { op, operands });
        ValueRef::Node(self.body.len() - 1)
    }

    pub fn output(mut self, value: ValueRef) -> Self {
        self.outputs.push(value);
        self
    }

    pub fn update_resource(mut self, arg: usize, value: ValueRef) -> Self {
        self.resource_updates.push((arg, value));
        self
    }

    /// `f(x) = x` over a single argument.
    pub fn identity(name: impl Into<String>) -> Self {
        Self::new(name, 1).output(ValueRef::Arg(0))
    }

    /// `f(a, b) = op(a, b)`.
    pub fn binary_fn(name: impl Into<String>, op: Primitive) -> Self {
        let mut def = Self::new(name, 2);
        let out = def.binary(op, ValueRef::Arg(0), ValueRef::Arg(1));
        def.output(out)
    }
}

/// Functions available to the compiler.
#[derive(Debug, Clone, Default)]
pub struct FunctionLibraryDefinition {
    functions: HashMap<String, Arc<FunctionDef>>,
}

impl FunctionLibraryDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `def`, replacing any function of the same name.
    pub fn add(&mut self, def: FunctionDef) -> &mut Self {
        self.functions.insert(def.name.clone(), Arc::new(def));
        self
    }

    pub fn with(mut self, def: FunctionDef) -> Self {
        self.add(def);
        self
    }

    pub fn find(&self, name: &str) -> Option<Arc<FunctionDef>> {
        self.functions.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

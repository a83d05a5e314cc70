use std::cell::{Cell, Ref, RefMut};
use std::rc::Rc;

use anyhow::Result;
use derivative::Derivative;
use ndarray::prelude::*;
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use serde::ser::{SerializeSeq, SerializeStruct};
use tracing::{debug, trace};

use crate::error::{check_shape, MergeError};
use crate::persist;
use super::{Float, Handle, Layer, LayerRef, Module};

/// Bumped whenever the persisted layout of a merge node changes
pub const SERIALIZATION_VERSION: u32 = 0;

#[derive(Derivative, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[derivative(Default)]
pub struct MergeConfig {
    /// false turns the node into a pass-through
    #[derivative(Default(value = "true"))]
    pub active: bool,
    /// true if an outer owner is responsible for the children
    pub externally_owned: bool,
}

/// Runs every child on the same input and multiplies their outputs element-wise.
///
/// Backward hands the undivided upstream gradient to every child and sums the
/// children's deltas. This is not the product rule (each delta would have to be
/// scaled by the other children's outputs), it is only exact for a single child.
///
/// Children are driven strictly in insertion order. Every call overwrites the
/// children's output/delta buffers, which is visible to any other parent sharing
/// them. The handles are `Rc` based, so a node cannot cross threads.
///
/// With `externally_owned` the node only references its children and never releases
/// them, otherwise it keeps them alive until it is dropped.
///
/// There is no `Clone`: a copy is made with [`MultiplyMerge::shallow_copy`], which shares
/// the children and takes the copy's ownership as an argument.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MultiplyMerge<T: Float> {
    children: Vec<Handle<T>>,
    active: bool,
    externally_owned: bool,
    output: Array2<T>,
    delta: Array2<T>,
    /// set while a shared walk over the children (parameter count, serialization) is running
    #[derivative(Debug = "ignore")]
    visiting: Cell<bool>,
}

/// Marks a node as being walked until dropped
struct Visit<'a>(&'a Cell<bool>);

impl<'a> Visit<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Visit(flag)
    }
}

impl<'a> Drop for Visit<'a> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Shared borrow of a child. A merge node that is being walked further up the stack is
/// reported as in use, a shared borrow alone would not stop the recursion.
fn borrow_child<T: Float>(child: &LayerRef<T>, index: usize) -> Result<Ref<'_, Layer<T>>, MergeError> {
    let layer = child.try_borrow().map_err(|_| MergeError::ChildInUse { index })?;
    if layer.as_merge().map_or(false, |m| m.visiting.get()) {
        return Err(MergeError::ChildInUse { index });
    }
    Ok(layer)
}

fn borrow_child_mut<T: Float>(child: &LayerRef<T>, index: usize) -> Result<RefMut<'_, Layer<T>>, MergeError> {
    child.try_borrow_mut().map_err(|_| MergeError::ChildInUse { index })
}

impl<T: Float> MultiplyMerge<T> {
    pub fn new(active: bool, externally_owned: bool) -> Self {
        Self {
            children: Vec::new(),
            active,
            externally_owned,
            output: Array2::zeros((0, 0)),
            delta: Array2::zeros((0, 0)),
            visiting: Cell::new(false),
        }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(config.active, config.externally_owned)
    }

    /// Constructs a child in place and returns a strong reference to it. An externally
    /// owned node only keeps a weak handle, the returned reference is what keeps the child
    /// alive and belongs to the outer owner.
    pub fn add<L: Into<Layer<T>>>(&mut self, layer: L) -> LayerRef<T> {
        let layer = layer.into().into_ref();
        self.add_shared(&layer);
        layer
    }

    /// Appends a child that may be referenced elsewhere in the graph. An externally owned
    /// node only keeps a weak reference, otherwise the node shares ownership.
    pub fn add_shared(&mut self, layer: &LayerRef<T>) {
        let handle = if self.externally_owned {
            Handle::External(Rc::downgrade(layer))
        } else {
            Handle::Owned(layer.clone())
        };
        self.children.push(handle);
    }

    pub fn children(&self) -> &[Handle<T>] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Handle<T>> {
        &mut self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Drops every handle now, owned children without other owners are released
    pub fn clear(&mut self) {
        let owned = self.children.iter().filter(|h| h.is_owned()).count();
        trace!(owned, total = self.children.len(), "releasing children");
        self.children.clear();
    }

    /// Strong references to every child, in order
    pub fn model(&self) -> Result<Vec<LayerRef<T>>, MergeError> {
        self.children.iter()
            .enumerate()
            .map(|(i, h)| h.resolve(i))
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn externally_owned(&self) -> bool {
        self.externally_owned
    }

    /// Copies the handle list and the flags, not the children. With `externally_owned` every handle of the
    /// copy is weak, otherwise every handle is strong and the copy keeps the children alive.
    pub fn shallow_copy(&self, externally_owned: bool) -> Result<Self, MergeError> {
        let children = self.children.iter()
            .enumerate()
            .map(|(i, h)| {
                if externally_owned {
                    Ok(Handle::External(h.downgrade()))
                } else {
                    h.resolve(i).map(Handle::Owned)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            children,
            active: self.active,
            externally_owned,
            output: self.output.clone(),
            delta: self.delta.clone(),
            visiting: Cell::new(false),
        })
    }

    /// children of an active node, which must not be empty
    fn resolve_active(&self) -> Result<Vec<LayerRef<T>>, MergeError> {
        if self.children.is_empty() {
            return Err(MergeError::EmptyChildSet);
        }
        self.model()
    }

    /// Replaces the whole node with a persisted one, previously held children are dropped first.
    /// The restored children are held the way the persisted ownership flag says and are
    /// returned for the caller to keep.
    fn restore(&mut self, record: MergeRecord<T>) -> Result<Vec<LayerRef<T>>, MergeError> {
        if record.version != SERIALIZATION_VERSION {
            return Err(MergeError::Version { expected: SERIALIZATION_VERSION, found: record.version });
        }
        self.clear();
        self.active = record.active;
        self.externally_owned = record.externally_owned;
        self.output = Array2::zeros((0, 0));
        self.delta = Array2::zeros((0, 0));
        Ok(record.children.into_iter().map(|l| self.add(l)).collect())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        persist::to_bytes(self)
    }

    /// Restores a node that owns its children, see [`MultiplyMerge::load_bytes`] for
    /// externally owned ones
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        persist::from_bytes(bytes)
    }

    pub fn to_ron(&self) -> Result<String> {
        persist::to_ron(self)
    }

    pub fn from_ron(text: &str) -> Result<Self> {
        persist::from_ron(text)
    }

    /// Loads a bincode encoded node into self and returns the restored children. When the
    /// persisted node was externally owned the caller becomes their owner and has to keep
    /// the returned references alive.
    #[tracing::instrument(skip_all, name = "MultiplyMerge::load_bytes")]
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<Vec<LayerRef<T>>> {
        let record: MergeRecord<T> = persist::from_bytes(bytes)?;
        let children = self.restore(record)?;
        debug!(children = children.len(), active = self.active, externally_owned = self.externally_owned, "restored merge node");
        Ok(children)
    }

    pub fn load_ron(&mut self, text: &str) -> Result<Vec<LayerRef<T>>> {
        let record: MergeRecord<T> = persist::from_ron(text)?;
        Ok(self.restore(record)?)
    }
}

impl<T: Float> Module<T> for MultiplyMerge<T> {
    #[tracing::instrument(skip_all, name = "MultiplyMerge::forward")]
    fn forward(&mut self, input: &Array2<T>) -> Result<()> {
        if !self.active {
            trace!("pass-through");
            self.output = input.clone();
            return Ok(());
        }

        let children = self.resolve_active()?;
        for (i, child) in children.iter().enumerate() {
            borrow_child_mut(child, i)?.forward(input)?;
        }

        let mut output = borrow_child(&children[0], 0)?.output().clone();
        for (i, child) in children.iter().enumerate().skip(1) {
            let child = borrow_child(child, i)?;
            check_shape(output.shape(), child.output().shape())?;
            output *= child.output();
        }

        debug!(children = children.len(), shape = ?output.shape(), "merged outputs");
        self.output = output;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "MultiplyMerge::backward")]
    fn backward(&mut self, gy: &Array2<T>) -> Result<()> {
        if !self.active {
            trace!("pass-through");
            self.delta = gy.clone();
            return Ok(());
        }

        let children = self.resolve_active()?;
        for (i, child) in children.iter().enumerate() {
            borrow_child_mut(child, i)?.backward(gy)?;
        }

        let mut g = borrow_child(&children[0], 0)?.delta().clone();
        for (i, child) in children.iter().enumerate().skip(1) {
            let child = borrow_child(child, i)?;
            check_shape(g.shape(), child.delta().shape())?;
            g += child.delta();
        }

        debug!(children = children.len(), shape = ?g.shape(), "summed deltas");
        self.delta = g;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "MultiplyMerge::gradient")]
    fn gradient(&mut self, input: &Array2<T>, error: &Array2<T>) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        let children = self.resolve_active()?;
        for (i, child) in children.iter().enumerate() {
            borrow_child_mut(child, i)?.gradient(input, error)?;
        }
        Ok(())
    }

    fn output(&self) -> &Array2<T> {
        &self.output
    }

    fn delta(&self) -> &Array2<T> {
        &self.delta
    }

    fn parameters(&self) -> Result<usize> {
        let _visit = Visit::enter(&self.visiting);
        let mut n = 0;
        for (i, child) in self.model()?.iter().enumerate() {
            n += borrow_child(child, i)?.parameters()?;
        }
        Ok(n)
    }

    fn zero_grad(&mut self) -> Result<()> {
        for (i, child) in self.model()?.iter().enumerate() {
            borrow_child_mut(child, i)?.zero_grad()?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MultiplyMerge"
    }
}

/// Persisted layout, children are stored by value and tagged with their layer type
#[derive(Deserialize)]
#[serde(rename = "MultiplyMerge", bound(deserialize = "T: Float"))]
struct MergeRecord<T: Float> {
    version: u32,
    children: Vec<Layer<T>>,
    active: bool,
    externally_owned: bool,
}

struct ChildrenRef<'a, T: Float>(&'a [Handle<T>]);

impl<'a, T: Float> Serialize for ChildrenRef<'a, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for (i, handle) in self.0.iter().enumerate() {
            let child = handle.resolve(i).map_err(<S::Error as ser::Error>::custom)?;
            let layer = borrow_child(&child, i).map_err(<S::Error as ser::Error>::custom)?;
            seq.serialize_element(&*layer)?;
        }
        seq.end()
    }
}

impl<T: Float> Serialize for MultiplyMerge<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let _visit = Visit::enter(&self.visiting);
        let mut state = serializer.serialize_struct("MultiplyMerge", 4)?;
        state.serialize_field("version", &SERIALIZATION_VERSION)?;
        state.serialize_field("children", &ChildrenRef(&self.children))?;
        state.serialize_field("active", &self.active)?;
        state.serialize_field("externally_owned", &self.externally_owned)?;
        state.end()
    }
}

impl<'de, T: Float> Deserialize<'de> for MultiplyMerge<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let record = MergeRecord::<T>::deserialize(deserializer)?;
        // nothing outside the node could keep the children of an externally owned node alive
        if record.externally_owned {
            return Err(<D::Error as de::Error>::custom(MergeError::Unowned));
        }
        let mut merge = MultiplyMerge::new(record.active, record.externally_owned);
        merge.restore(record).map_err(<D::Error as de::Error>::custom)?;
        Ok(merge)
    }
}

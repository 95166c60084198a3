// Linear — Fully-connected layer on top of the graph registry
//
//   y = x · W + b
//
//   x: [rows, in_features]
//   W: [in_features, out_features]
//   b: [1, out_features]   broadcast across rows
//
// Parameters are trainable nodes of the registry. The layer itself is a
// UnitState ("linear") holding the parameter keys and the feature sizes, so
// a Linear can be rebuilt from its UnitKey alone.
//
// Weights and bias are drawn from U(-k, k) with k = sqrt(1 / in_features).

use sable_core::{Device, Error, Init, Result, Shape};

use crate::graph::{GraphRegistry, NodeKey, StorageType, UnitKey, UnitState};
use crate::ops;

const KIND: &str = "linear";

/// A fully-connected layer: y = xW + b.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    unit: UnitKey,
    weight: NodeKey,
    bias: Option<NodeKey>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Register the parameters and the unit state of a new layer.
    pub fn new(
        registry: &mut GraphRegistry,
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        device: Device,
    ) -> Result<Self> {
        let k = (1.0 / in_features.max(1) as f32).sqrt();
        let weight = parameter(registry, vec![in_features, out_features], device, k)?;
        let bias = if use_bias {
            Some(parameter(registry, vec![1, out_features], device, k)?)
        } else {
            None
        };

        let mut state = UnitState::new(KIND)
            .with_tensor("weight", weight)
            .with_scalar("in_features", in_features as f64)
            .with_scalar("out_features", out_features as f64);
        if let Some(b) = bias {
            state.set_tensor("bias", b);
        }
        let unit = registry.register_unit(state);

        Ok(Linear {
            unit,
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Rebuild a layer from its registered unit state.
    pub fn from_unit(registry: &GraphRegistry, unit: UnitKey) -> Result<Self> {
        let state = registry.unit(unit)?;
        if state.kind() != KIND {
            return Err(Error::invalid_argument(format!(
                "{unit} is a '{}' unit, not '{KIND}'",
                state.kind()
            )));
        }
        Ok(Linear {
            unit,
            weight: state.tensor("weight")?,
            bias: state.try_tensor("bias"),
            in_features: state.scalar("in_features")? as usize,
            out_features: state.scalar("out_features")? as usize,
        })
    }

    /// Record `x · W (+ b)` in the registry and return the output key.
    pub fn forward(&self, registry: &mut GraphRegistry, x: NodeKey) -> Result<NodeKey> {
        let cols = registry.node(x)?.shape().cols();
        if cols != self.in_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(vec![self.in_features])?,
                got: Shape::new(vec![cols])?,
            });
        }
        let y = ops::matmul(registry, x, self.weight)?;
        match self.bias {
            Some(b) => ops::add(registry, y, b),
            None => Ok(y),
        }
    }

    pub fn unit(&self) -> UnitKey {
        self.unit
    }

    pub fn weight(&self) -> NodeKey {
        self.weight
    }

    pub fn bias(&self) -> Option<NodeKey> {
        self.bias
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Parameter keys (weight first).
    pub fn parameters(&self) -> Vec<NodeKey> {
        std::iter::once(self.weight).chain(self.bias).collect()
    }
}

fn parameter(registry: &mut GraphRegistry, dims: Vec<usize>, device: Device, k: f32) -> Result<NodeKey> {
    let key = registry.register_node(Shape::new(dims)?, StorageType::Dense, device, 1, true)?;
    Init::Uniform { low: -k, high: k }.apply(registry.node(key)?.forward())?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_from_unit() {
        let mut reg = GraphRegistry::host("t");
        let layer = Linear::new(&mut reg, 4, 3, true, Device::host()).unwrap();
        let rebuilt = Linear::from_unit(&reg, layer.unit()).unwrap();
        assert_eq!(layer, rebuilt);
        assert_eq!(reg.node(layer.weight()).unwrap().shape().dims(), &[4, 3]);
        assert_eq!(layer.parameters().len(), 2);
        let w = reg.data(layer.weight()).unwrap();
        assert!(w.iter().all(|&v| (-0.5..0.5).contains(&v)));
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let mut reg = GraphRegistry::host("t");
        let layer = Linear::new(&mut reg, 4, 3, false, Device::host()).unwrap();
        let x = ops::zeros(&mut reg, Shape::new(vec![2, 5]).unwrap(), Device::host(), false)
            .unwrap();
        assert!(matches!(
            layer.forward(&mut reg, x),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}

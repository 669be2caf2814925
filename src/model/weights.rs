//! Weight sources for the two modules.
//!
//! A module is built either from a Hugging Face backbone checkpoint (the
//! parameters this model adds on top do not exist there and start freshly
//! initialized) or from a full snapshot of the module written after training.
//! [`ModuleWeights`] carries one `VarBuilder` for each kind of parameter. Both
//! use the module's own naming, so a snapshot serves both roles.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::{Error, Result};

/// Where a module reads its parameters from.
#[derive(Clone)]
pub struct ModuleWeights<'a> {
    /// Parameters of the pretrained backbone (embeddings, blocks, LM head).
    pub pretrained: VarBuilder<'a>,
    /// Parameters the backbone checkpoint does not carry (extractor head,
    /// importance projections, decoder cross-attention).
    pub added: VarBuilder<'a>,
}

impl<'a> ModuleWeights<'a> {
    /// Every parameter comes from one snapshot.
    pub fn snapshot(vb: VarBuilder<'a>) -> Self {
        Self {
            pretrained: vb.clone(),
            added: vb,
        }
    }

    /// Backbone from `pretrained`; added parameters initialized into `varmap`.
    pub fn with_fresh_added(pretrained: VarBuilder<'a>, varmap: &VarMap) -> Self {
        let added = VarBuilder::from_varmap(varmap, pretrained.dtype(), pretrained.device());
        Self { pretrained, added }
    }

    pub fn pp<S: ToString>(&self, prefix: S) -> Self {
        let prefix = prefix.to_string();
        Self {
            pretrained: self.pretrained.pp(&prefix),
            added: self.added.pp(&prefix),
        }
    }
}

/// Open a checkpoint file: safetensors, or a PyTorch pickle (`.bin`, `.pt`, `.pth`).
pub fn open_checkpoint(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    if !path.exists() {
        return Err(Error::WeightLoad(format!("{} does not exist", path.display())));
    }
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let vb = match extension {
        "bin" | "pt" | "pth" => VarBuilder::from_pth(path, dtype, device),
        _ => unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) },
    };
    vb.map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))
}

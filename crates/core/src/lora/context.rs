/// Which adapter a backbone forward pass applies, and whether LoRA dropout
/// is active.
///
/// Every [`super::LinearWithLora`] in the backbone looks the adapter up by
/// name, so one frozen backbone can carry several tasks at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoraContext<'a> {
    adapter: Option<&'a str>,
    train: bool,
}

impl<'a> LoraContext<'a> {
    /// Base weights only.
    pub fn none() -> Self {
        Self::default()
    }

    /// Eval-mode pass through `name`.
    pub fn with_adapter(name: &'a str) -> Self {
        Self {
            adapter: Some(name),
            train: false,
        }
    }

    /// Training pass through `name`: dropout on the LoRA input.
    pub fn training(name: &'a str) -> Self {
        Self {
            adapter: Some(name),
            train: true,
        }
    }

    pub fn adapter_name(&self) -> Option<&'a str> {
        self.adapter
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn is_training(&self) -> bool {
        self.train
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_only_context() {
        let ctx = LoraContext::none();
        assert!(!ctx.has_adapter());
        assert!(!ctx.is_training());
    }

    #[test]
    fn eval_and_training_contexts() {
        let eval = LoraContext::with_adapter("model1");
        assert_eq!(eval.adapter_name(), Some("model1"));
        assert!(!eval.is_training());

        let train = LoraContext::training("model1");
        assert_eq!(train.adapter_name(), Some("model1"));
        assert!(train.is_training());
        assert_ne!(eval, train);
    }
}

/// Implements the queue and lifecycle accessors of `Element` by delegating
/// to an `ElementCore` field named `core`.
#[macro_export]
macro_rules! delegate_element_core {
    () => {
        fn name(&self) -> &'static str {
            self.core.name()
        }

        fn inlet(&self) -> $crate::pipeline::Inlet {
            self.core.inlet()
        }

        fn take_outlet(
            &mut self,
        ) -> Option<tokio::sync::mpsc::Receiver<$crate::pipeline::StreamMessage>> {
            self.core.take_outlet()
        }

        fn state(&self) -> $crate::pipeline::ElementState {
            self.core.state()
        }

        fn health(&self) -> std::sync::Arc<$crate::pipeline::ElementHealth> {
            self.core.health()
        }
    };
}

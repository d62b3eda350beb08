//! Typed handler lookup.

use sluice_core::InterruptType;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{InterruptError, InterruptResult};
use crate::handlers::{
    DiscontinueHandler, HandlerContext, InterruptHandler, MarkExpiredHandler, MarkStatusHandler,
    PauseHandler, ResumeHandler, RetryHandler,
};

/// Map from interrupt type to its handler
///
/// Construction fails unless every [`InterruptType`] has a handler, so a
/// factory that exists can always dispatch.
pub struct HandlerFactory {
    handlers: HashMap<InterruptType, Arc<dyn InterruptHandler>>,
}

impl HandlerFactory {
    /// Build a factory from an explicit registration table
    ///
    /// # Errors
    ///
    /// Returns [`InterruptError::MissingHandler`] for the first unregistered type
    pub fn new(handlers: HashMap<InterruptType, Arc<dyn InterruptHandler>>) -> InterruptResult<Self> {
        if let Some(missing) = InterruptType::ALL.iter().find(|t| !handlers.contains_key(t)) {
            return Err(InterruptError::MissingHandler(*missing));
        }
        Ok(Self { handlers })
    }

    /// The standard handler set
    #[must_use]
    pub fn standard(ctx: &HandlerContext) -> Self {
        let mut handlers: HashMap<InterruptType, Arc<dyn InterruptHandler>> = HashMap::new();
        handlers.insert(InterruptType::AbortAll, Arc::new(DiscontinueHandler::abort(ctx.clone())));
        handlers.insert(InterruptType::ExpireAll, Arc::new(DiscontinueHandler::expire(ctx.clone())));
        handlers.insert(InterruptType::PauseAll, Arc::new(PauseHandler::new(ctx.clone())));
        handlers.insert(InterruptType::ResumeAll, Arc::new(ResumeHandler::new(ctx.clone())));
        handlers.insert(InterruptType::Retry, Arc::new(RetryHandler::new(ctx.clone())));
        handlers.insert(InterruptType::MarkExpired, Arc::new(MarkExpiredHandler::new(ctx.clone())));
        handlers.insert(InterruptType::MarkSuccess, Arc::new(MarkStatusHandler::success(ctx.clone())));
        handlers.insert(InterruptType::MarkFailed, Arc::new(MarkStatusHandler::failed(ctx.clone())));
        Self { handlers }
    }

    /// Handler for a type
    ///
    /// # Errors
    ///
    /// Never fails for a factory built through [`HandlerFactory::new`] or
    /// [`HandlerFactory::standard`]
    pub fn get(&self, interrupt_type: InterruptType) -> InterruptResult<&Arc<dyn InterruptHandler>> {
        self.handlers
            .get(&interrupt_type)
            .ok_or(InterruptError::MissingHandler(interrupt_type))
    }
}

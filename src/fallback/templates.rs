//! Emergency 级别：静态模板查表
//!
//! 纯函数，按（调用目的, 意图）取一条编译期常量文本；所有模板非空，对任意输入都不会失败。

use crate::core::Purpose;
use crate::fallback::intent::{classify_intent, Intent};
use crate::fallback::FallbackContext;

const GREETING: &str = "Hello! I'm here and ready to help. What would you like to work on?";
const FAREWELL: &str = "Goodbye! Come back any time.";
const THANKS: &str = "You're welcome! Let me know if there's anything else.";
const HELP: &str = "I can answer questions and hand tasks to specialised assistants. \
                    Tell me what you need and I'll take it from there.";
const ERROR: &str = "Sorry, something went wrong while I was working on that. \
                     Please try again in a moment.";
const BUDGET: &str = "I wasn't able to finish that request within my working limits. \
                      Could you narrow it down or try again?";
const GENERIC: &str = "I'm having trouble generating a full answer right now. \
                       Please try again shortly or rephrase your request.";

#[derive(Debug, Clone, Copy, Default)]
pub struct EmergencyTemplates;

impl EmergencyTemplates {
    pub fn respond(&self, message: &str, context: &FallbackContext) -> &'static str {
        match context.purpose {
            Purpose::ErrorRecovery => ERROR,
            Purpose::BudgetExhausted => BUDGET,
            Purpose::DirectResponse => match classify_intent(message) {
                Intent::Greeting => GREETING,
                Intent::Farewell => FAREWELL,
                Intent::Thanks => THANKS,
                Intent::Help => HELP,
                Intent::Question | Intent::Generic => GENERIC,
            },
        }
    }

    /// 全部模板（测试非空性用）
    pub fn all() -> [&'static str; 7] {
        [GREETING, FAREWELL, THANKS, HELP, ERROR, BUDGET, GENERIC]
    }
}

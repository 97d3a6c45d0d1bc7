use boa_engine::{Context, Source};

use crate::constants::{JS_LOOP_ITERATION_LIMIT, JS_RECURSION_LIMIT};
use crate::VideoError;

/// Evaluates extracted player functions in an ECMAScript engine with no
/// host bindings: no network, no filesystem, no timers. Runaway scripts
/// are cut off by the engine's loop-iteration and recursion limits, which
/// keeps cancellation cooperative.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JsSandbox {
    loop_iteration_limit: u64,
    recursion_limit: usize,
}

impl Default for JsSandbox {
    fn default() -> Self {
        Self {
            loop_iteration_limit: JS_LOOP_ITERATION_LIMIT,
            recursion_limit: JS_RECURSION_LIMIT,
        }
    }
}

impl JsSandbox {
    /// Load `source` (a `var name=function(...){...};` program) and call
    /// `name` with one string argument, returning the string result.
    pub fn evaluate_unary(
        &self,
        source: &str,
        fn_name: &str,
        input: &str,
    ) -> Result<String, VideoError> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(self.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(self.recursion_limit);

        context
            .eval(Source::from_bytes(source))
            .map_err(|error| VideoError::JsEvaluationError(error.to_string()))?;

        // JSON-encode the argument so arbitrary challenge strings cannot
        // escape the call expression.
        let argument = serde_json::to_string(input)
            .map_err(|error| VideoError::JsEvaluationError(error.to_string()))?;
        let call = format!("{fn_name}({argument})");

        let value = context
            .eval(Source::from_bytes(&call))
            .map_err(|error| VideoError::JsEvaluationError(error.to_string()))?;

        value
            .as_string()
            .and_then(|js_string| js_string.to_std_string().ok())
            .ok_or_else(|| {
                VideoError::JsEvaluationError(format!("{fn_name} did not return a string"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_string_transform() {
        let sandbox = JsSandbox::default();
        let source = "var nsig=function(a){return a.split(\"\").reverse().join(\"\")};";
        assert_eq!(
            sandbox.evaluate_unary(source, "nsig", "abcd").unwrap(),
            "dcba"
        );
    }

    #[test]
    fn handles_regex_and_array_heavy_bodies() {
        let sandbox = JsSandbox::default();
        let source = concat!(
            "var nsig=function(a){",
            "var b=a.match(/[a-z]+/g)||[];",
            "b.push(String(a.length));",
            "return b.join(\"-\")",
            "};"
        );
        assert_eq!(
            sandbox.evaluate_unary(source, "nsig", "ab1cd").unwrap(),
            "ab-cd-5"
        );
    }

    #[test]
    fn escapes_hostile_input() {
        let sandbox = JsSandbox::default();
        let source = "var nsig=function(a){return a};";
        let hostile = r#"");globalThis.x=1;("#;
        assert_eq!(
            sandbox.evaluate_unary(source, "nsig", hostile).unwrap(),
            hostile
        );
    }

    #[test]
    fn infinite_loop_is_cut_off() {
        let sandbox = JsSandbox {
            loop_iteration_limit: 1000,
            recursion_limit: 64,
        };
        let source = "var nsig=function(a){while(true){a+=\"x\"}return a};";
        assert!(matches!(
            sandbox.evaluate_unary(source, "nsig", "seed"),
            Err(VideoError::JsEvaluationError(_))
        ));
    }

    #[test]
    fn non_string_result_is_an_error() {
        let sandbox = JsSandbox::default();
        let source = "var nsig=function(a){return 42};";
        assert!(sandbox.evaluate_unary(source, "nsig", "x").is_err());
    }
}

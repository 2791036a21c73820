//! JavaScript fragments injected into rendered pages.
//!
//! Everything the service stores inside the page hangs off a context object
//! under a random 32-character window key, so page scripts cannot guess or
//! clobber it. The capture helpers serialize the document *synchronously*
//! inside the signalling handler: no microtask of the page can mutate the
//! DOM between the trigger firing and the HTML being latched.

use rand::distributions::Alphanumeric;
use rand::Rng;

const KEY_LEN: usize = 32;

/// JS expression serializing the live document.
pub fn live_html_expr() -> &'static str {
    "(document.doctype ? '<!DOCTYPE ' + document.doctype.name + '>' : '') \
     + document.documentElement.outerHTML"
}

/// Random alphanumeric token for magic-dialog rendezvous.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect()
}

/// A JS string literal for `value`, correctly escaped.
pub fn js_string(value: &str) -> String {
    serde_json::to_string(value).expect("strings always serialize")
}

/// Per-page context object handle.
#[derive(Clone, Debug)]
pub struct PageContext {
    key: String,
}

impl Default for PageContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PageContext {
    pub fn new() -> Self {
        Self {
            key: random_token(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Creates the context object; runs before any page script.
    pub fn init_script(&self) -> String {
        let key = js_string(&self.key);
        format!("window[{key}] = window[{key}] || {{}};")
    }

    /// Expression reading a named slot (undefined when absent).
    pub fn read_slot_expr(&self, slot: &str) -> String {
        let key = js_string(&self.key);
        let slot = js_string(slot);
        format!("(window[{key}] || {{}})[{slot}]")
    }

    /// Expression for the final HTML: the synchronously latched capture
    /// when a trigger saved one, the live document otherwise.
    pub fn read_html_expr(&self) -> String {
        let key = js_string(&self.key);
        format!(
            "(window[{key}] && window[{key}].html) || ({live})",
            live = live_html_expr()
        )
    }

    /// Statements latching the document and signalling through a magic
    /// dialog, shared by the variable and event hooks.
    fn capture_and_signal(&self, token: &str) -> String {
        let key = js_string(&self.key);
        let token = js_string(token);
        format!(
            "var slots = window[{key}] = window[{key}] || {{}};\n\
             if (!slots.completed) {{\n\
               slots.completed = true;\n\
               slots.html = {live};\n\
               window.prompt('', {token});\n\
             }}",
            live = live_html_expr()
        )
    }

    /// Accessor hook: fires when `window[var_name]` is assigned `true`.
    pub fn variable_hook_script(&self, var_name: &str, token: &str) -> String {
        let var = js_string(var_name);
        let body = self.capture_and_signal(token);
        format!(
            "(function() {{\n\
               var current = window[{var}];\n\
               Object.defineProperty(window, {var}, {{\n\
                 configurable: true,\n\
                 get: function() {{ return current; }},\n\
                 set: function(value) {{\n\
                   current = value;\n\
                   if (value === true) {{\n\
                     {body}\n\
                   }}\n\
                 }}\n\
               }});\n\
             }})();"
        )
    }

    /// Event-listener hook on a named global (`window`, `document`, ...).
    pub fn event_hook_script(&self, target: &str, event_name: &str, token: &str) -> String {
        let target = js_string(target);
        let event = js_string(event_name);
        let body = self.capture_and_signal(token);
        format!(
            "(function() {{\n\
               var target = window[{target}] || window;\n\
               target.addEventListener({event}, function() {{\n\
                 {body}\n\
               }});\n\
             }})();"
        )
    }
}

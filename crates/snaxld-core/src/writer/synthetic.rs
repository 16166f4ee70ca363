//! Bodies the linker must synthesize itself.
//!
//! Both the `__wasm_call_ctors` caller and the contract entry function
//! are assembled directly as bytecode from the opcode primitives; no
//! higher-level code generator is involved. The entry function routes a
//! `(receiver, code, action)` triple of packed 64-bit names through a
//! two-level if/else chain: action handlers when `receiver == code`,
//! notification handlers (grouped by originating code, with a `"*"`
//! wildcard group) otherwise.

use std::collections::{BTreeMap, HashSet};

use crate::context::LinkContext;
use crate::encode::{write_sleb128, write_u8, write_uleb128};
use crate::format::opcode;
use crate::name::string_to_name;

use super::InitEntry;

pub const SNAX_COMPILER_ERROR_BASE: u64 = 8_000_000_000_000_000_000;
pub const SNAX_ERROR_NO_ACTION: u64 = SNAX_COMPILER_ERROR_BASE;
pub const SNAX_ERROR_ONERROR: u64 = SNAX_COMPILER_ERROR_BASE + 1;

/// Synthesize the `__wasm_call_ctors` body: one CALL per init function in
/// priority order, no locals.
pub fn create_ctor_function(ctx: &mut LinkContext, init_functions: &[InitEntry]) {
    let Some(chunk) = ctx.well_known.call_ctors_func else {
        return;
    };
    let mut body = Vec::new();
    write_uleb128(&mut body, 0); // num locals
    for entry in init_functions {
        write_u8(&mut body, opcode::CALL);
        write_uleb128(&mut body, ctx.function_index(entry.sym).unwrap_or(0) as u64);
    }
    write_u8(&mut body, opcode::END);
    ctx.synthetic_functions[chunk as usize].body = body;
}

fn find_function_index(ctx: &LinkContext, name: &str) -> Option<u32> {
    ctx.symtab.find(name).and_then(|id| ctx.function_index(id))
}

/// Emits the dispatch body while keeping count of every `if` left open,
/// so the tail can close them all.
struct DispatchBuilder<'a> {
    ctx: &'a LinkContext,
    body: Vec<u8>,
    missing: Vec<String>,
}

impl<'a> DispatchBuilder<'a> {
    fn op(&mut self, byte: u8) {
        write_u8(&mut self.body, byte);
    }

    fn get_local(&mut self, slot: u32) {
        self.op(opcode::GET_LOCAL);
        write_uleb128(&mut self.body, slot as u64);
    }

    fn i64_const(&mut self, value: i64) {
        self.op(opcode::I64_CONST);
        write_sleb128(&mut self.body, value);
    }

    fn i32_const(&mut self, value: i32) {
        self.op(opcode::I32_CONST);
        write_sleb128(&mut self.body, value as i64);
    }

    fn call(&mut self, index: u32) {
        self.op(opcode::CALL);
        write_uleb128(&mut self.body, index as u64);
    }

    fn if_void(&mut self, opened: &mut u32) {
        self.op(opcode::IF);
        self.op(opcode::BLOCK_VOID);
        *opened += 1;
    }

    /// The create-if pattern shared by action and notify dispatch. `entry`
    /// is `"<name>:<handler>"`; the handler is called with
    /// `(receiver, code)`. Repeated branches chain with a leading `else`.
    fn create_if(&mut self, entry: &str, need_else: &mut bool, opened: &mut u32) {
        if *need_else {
            self.op(opcode::ELSE);
        }
        *need_else = true;

        let split = entry.find(':').unwrap_or(entry.len());
        let name = string_to_name(&entry[..split]);
        self.i64_const(name as i64);
        self.get_local(2); // action
        self.op(opcode::I64_EQ);
        self.if_void(opened);
        self.get_local(0); // receiver
        self.get_local(1); // code
        let handler = entry.get(split + 1..).unwrap_or("");
        match find_function_index(self.ctx, handler) {
            Some(index) => self.call(index),
            None => {
                self.missing.push(handler.to_string());
                self.call(0);
            }
        }
    }

    /// `if <local> != name("snax")`, used to spare the system account from
    /// the no-handler asserts.
    fn if_local_ne_snax(&mut self, slot: u32, opened: &mut u32) {
        self.get_local(slot);
        self.i64_const(string_to_name("snax") as i64);
        self.op(opcode::I64_NE);
        self.if_void(opened);
    }

    fn call_with_triple(&mut self, index: u32) {
        self.get_local(0);
        self.get_local(1);
        self.get_local(2);
        self.call(index);
    }
}

/// Synthesize the contract entry function.
///
/// Only called when the user did not define an entry point. The body
/// expects three `i64` parameters `(receiver, code, action)` in local
/// slots 0..3 and returns nothing.
pub fn create_dispatch_function(ctx: &mut LinkContext) {
    let Some(entry_chunk) = ctx.well_known.entry_func else {
        return;
    };

    let assert_index = match find_function_index(ctx, "snax_assert_code") {
        Some(i) => i,
        None => {
            ctx.diagnostics
                .error("entry dispatch requires snax_assert_code");
            return;
        }
    };
    let ctors = ctx
        .well_known
        .call_ctors
        .and_then(|id| ctx.function_index(id));
    let pre = find_function_index(ctx, "pre_dispatch");
    let post = find_function_index(ctx, "post_dispatch");
    let dtors = find_function_index(ctx, "__cxa_finalize");

    // Action entries in discovery order, deduplicated by exact string.
    let mut seen = HashSet::new();
    let mut actions = Vec::new();
    for file in &ctx.files {
        for act in &file.actions {
            if seen.insert(act.clone()) {
                actions.push(act.clone());
            }
        }
    }

    // Notify entries grouped by code name, in sorted group order.
    let mut seen = HashSet::new();
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for file in &ctx.files {
        for entry in &file.notify {
            if seen.insert(entry.clone()) {
                // "<code>::<action>:<handler>"
                let split = entry.find(':').unwrap_or(entry.len());
                let code = entry[..split].to_string();
                let rest = entry.get(split + 2..).unwrap_or("").to_string();
                groups.entry(code).or_default().push(rest);
            }
        }
    }
    let has_onerror_handler = groups
        .get("snax")
        .map(|entries| {
            entries
                .iter()
                .any(|e| e.split(':').next() == Some("onerror"))
        })
        .unwrap_or(false);

    let mut b = DispatchBuilder {
        ctx,
        body: Vec::new(),
        missing: Vec::new(),
    };
    write_uleb128(&mut b.body, 0); // num locals

    if let Some(ctors_index) = ctors {
        b.call(ctors_index);
    }

    let mut pre_opened = 0u32;
    if let Some(pre_index) = pre {
        b.call_with_triple(pre_index);
        b.if_void(&mut pre_opened);
    }

    // if receiver == code: action dispatch.
    let mut outer_opened = 0u32;
    b.get_local(0);
    b.get_local(1);
    b.op(opcode::I64_EQ);
    b.if_void(&mut outer_opened);
    {
        let mut opened = 0u32;
        let mut need_else = false;
        for act in &actions {
            b.create_if(act, &mut need_else, &mut opened);
        }
        if opened > 0 {
            b.op(opcode::ELSE);
        }

        // No action matched: assert unless the receiver is the system
        // account, in which case fall through to post_dispatch.
        let mut guard = 0u32;
        b.if_local_ne_snax(0, &mut guard);
        b.i32_const(0);
        b.i64_const(SNAX_ERROR_NO_ACTION as i64);
        b.call(assert_index);
        if let Some(post_index) = post {
            b.op(opcode::ELSE);
            b.call_with_triple(post_index);
        }
        b.op(opcode::END);
        for _ in 0..opened {
            b.op(opcode::END);
        }
    }
    b.op(opcode::ELSE);
    {
        // Notification dispatch.
        let mut opened = 0u32;
        b.if_local_ne_snax(0, &mut opened);

        // Without an onerror handler, an incoming snax::onerror aborts.
        if !has_onerror_handler {
            let mut probe = 0u32;
            b.i64_const(string_to_name("snax") as i64);
            b.get_local(1);
            b.op(opcode::I64_EQ);
            b.if_void(&mut probe);
            b.i64_const(string_to_name("onerror") as i64);
            b.get_local(2);
            b.op(opcode::I64_EQ);
            b.if_void(&mut probe);
            b.i32_const(0);
            b.i64_const(SNAX_ERROR_ONERROR as i64);
            b.call(assert_index);
            b.op(opcode::END);
            b.op(opcode::END);
            debug_assert_eq!(probe, 2);
        }

        // Code-specific groups chain as siblings: each group closes its
        // own handler chain before the next group's `else`, so the
        // transition always binds the group-level `if`.
        let mut group_need_else = false;
        let mut group_opened = 0u32;
        for (code, entries) in &groups {
            if code == "*" {
                continue;
            }
            if group_need_else {
                b.op(opcode::ELSE);
            }
            group_need_else = true;
            b.i64_const(string_to_name(code) as i64);
            b.get_local(1);
            b.op(opcode::I64_EQ);
            b.if_void(&mut group_opened);
            let mut handler_need_else = false;
            let mut handler_opened = 0u32;
            for entry in entries {
                b.create_if(entry, &mut handler_need_else, &mut handler_opened);
            }
            for _ in 0..handler_opened {
                b.op(opcode::END);
            }
        }

        // No group matched: the wildcard handlers, then post_dispatch.
        let wildcard = groups.get("*");
        let has_wildcard = wildcard.map(|w| !w.is_empty()).unwrap_or(false);
        if group_need_else && (has_wildcard || post.is_some()) {
            b.op(opcode::ELSE);
        }
        let mut wild_need_else = false;
        let mut wild_opened = 0u32;
        if let Some(wildcard) = wildcard {
            for entry in wildcard {
                b.create_if(entry, &mut wild_need_else, &mut wild_opened);
            }
        }
        if let Some(post_index) = post {
            if wild_need_else {
                b.op(opcode::ELSE);
            }
            b.call_with_triple(post_index);
        }
        for _ in 0..wild_opened {
            b.op(opcode::END);
        }
        for _ in 0..group_opened {
            b.op(opcode::END);
        }
        for _ in 0..opened {
            b.op(opcode::END);
        }
    }
    b.op(opcode::END); // closes receiver == code
    debug_assert_eq!(outer_opened, 1);

    if let Some(dtors_index) = dtors {
        b.i32_const(0);
        b.call(dtors_index);
    }
    for _ in 0..pre_opened {
        b.op(opcode::END);
    }
    b.op(opcode::END); // function body

    let DispatchBuilder { body, missing, .. } = b;
    if !missing.is_empty() {
        for name in missing {
            ctx.diagnostics
                .error(format!("entry dispatch handler not found: {}", name));
        }
        return;
    }
    ctx.synthetic_functions[entry_chunk as usize].body = body;
}

//! Image-code interpreter
//!
//! Executes one decoded method body per invocation: a locals table seeded
//! with the receiver and arguments, an operand stack bounded by the declared
//! maximum, and a program counter over decoded instructions. Nested calls
//! re-enter through the machine's dispatch, so frames live on the Rust call
//! stack.

use crate::class::{ClassDef, ClassId};
use crate::image::{CodeBody, ConstantPool, Op, PoolEntry};
use crate::machine::Machine;
use crate::object::{HandleKind, RawHandle};
use crate::value::{TypeRef, Value};
use crate::{VmError, VmResult};
use std::sync::Arc;

/// Execute a code body. `receiver` is `None` for static methods and the
/// class initialiser.
pub(crate) fn execute(
    machine: &Machine,
    class: &Arc<ClassDef>,
    pool: &ConstantPool,
    body: &CodeBody,
    receiver: Option<Value>,
    args: &[Value],
) -> VmResult<Value> {
    let mut locals = vec![Value::Null; body.max_locals as usize];
    let mut next = 0usize;
    if let Some(r) = receiver {
        store_local(&mut locals, next, r)?;
        next += 1;
    }
    for arg in args {
        store_local(&mut locals, next, *arg)?;
        next += 1;
    }

    let mut stack: Vec<Value> = Vec::with_capacity(body.max_stack as usize);
    let mut pc = 0usize;
    loop {
        let offset = body.offsets.get(pc).copied().unwrap_or(u32::MAX);
        let op = body
            .ops
            .get(pc)
            .ok_or(VmError::InvalidJump(offset))?;
        match op {
            Op::Nop => {}
            Op::Pop => {
                pop(&mut stack, offset)?;
            }
            Op::Dup => {
                let top = *stack.last().ok_or(VmError::StackUnderflow(offset))?;
                stack.push(top);
            }
            Op::ConstNull => stack.push(Value::Null),
            Op::Iconst(v) => stack.push(Value::Int(*v as i32)),
            Op::Bipush(v) => stack.push(Value::Int(*v as i32)),
            Op::Sipush(v) => stack.push(Value::Int(*v as i32)),
            Op::Ldc(idx) => match pool.get(*idx) {
                Some(PoolEntry::Int(i)) => stack.push(Value::Int(*i)),
                Some(PoolEntry::Utf8(s)) => stack.push(machine.new_string(s.clone())),
                _ => return Err(VmError::RuntimeError(format!("bad ldc index {idx}"))),
            },
            Op::LdcHandle(idx) => {
                let handle = resolve_handle(machine, class, pool, *idx)?;
                stack.push(machine.handle_value(handle));
            }
            Op::Load(slot) => {
                let v = locals
                    .get(*slot as usize)
                    .copied()
                    .ok_or(VmError::InvalidJump(offset))?;
                stack.push(v);
            }
            Op::Store(slot) => {
                let v = pop(&mut stack, offset)?;
                store_local(&mut locals, *slot as usize, v)?;
            }
            Op::New(idx) => {
                let name = class_ref(pool, *idx)?;
                let target = resolve_class(machine, class, name, false)?;
                stack.push(machine.alloc_instance(target));
            }
            Op::CheckCast(idx) => {
                let name = class_ref(pool, *idx)?;
                if !name.ends_with("[]") {
                    resolve_class(machine, class, name, true)?;
                }
                let value = pop(&mut stack, offset)?;
                if !value.is_null() && !machine.is_instance(value, name) {
                    return Err(VmError::ClassCast {
                        from: runtime_type_name(machine, value),
                        to: name.to_string(),
                    });
                }
                stack.push(value);
            }
            Op::GetField(idx) => {
                let (_, slot) = instance_field(machine, class, pool, *idx)?;
                let receiver = pop(&mut stack, offset)?;
                stack.push(machine.field_get(receiver, slot)?);
            }
            Op::PutField(idx) => {
                let (_, slot) = instance_field(machine, class, pool, *idx)?;
                let value = pop(&mut stack, offset)?;
                let receiver = pop(&mut stack, offset)?;
                machine.field_set(receiver, slot, value)?;
            }
            Op::GetStatic(idx) => {
                let (declaring, slot) = static_field(machine, class, pool, *idx)?;
                stack.push(machine.static_get(declaring, slot));
            }
            Op::PutStatic(idx) => {
                let (declaring, slot) = static_field(machine, class, pool, *idx)?;
                let value = pop(&mut stack, offset)?;
                machine.static_set(declaring, slot, value);
            }
            Op::AnewArray(idx) => {
                let name = class_ref(pool, *idx)?;
                let len = int_of(pop(&mut stack, offset)?)?;
                if len < 0 {
                    return Err(VmError::IndexOutOfBounds { index: len, len: 0 });
                }
                stack.push(machine.new_array(
                    TypeRef::parse(name),
                    vec![Value::Null; len as usize],
                ));
            }
            Op::Aaload => {
                let index = int_of(pop(&mut stack, offset)?)?;
                let array = pop(&mut stack, offset)?;
                stack.push(machine.array_get(array, index)?);
            }
            Op::Aastore => {
                let value = pop(&mut stack, offset)?;
                let index = int_of(pop(&mut stack, offset)?)?;
                let array = pop(&mut stack, offset)?;
                machine.array_set(array, index, value)?;
            }
            Op::ArrayLength => {
                let array = pop(&mut stack, offset)?;
                stack.push(Value::Int(machine.array_len(array)?));
            }
            Op::InvokeVirtual(idx) | Op::InvokeInterface(idx) => {
                invoke(machine, class, pool, *idx, InvokeKind::Virtual, &mut stack, offset)?;
            }
            Op::InvokeSpecial(idx) => {
                invoke(machine, class, pool, *idx, InvokeKind::Special, &mut stack, offset)?;
            }
            Op::InvokeStatic(idx) => {
                invoke(machine, class, pool, *idx, InvokeKind::Static, &mut stack, offset)?;
            }
            Op::TableSwitch {
                low,
                default,
                targets,
            } => {
                let key = int_of(pop(&mut stack, offset)?)?;
                let rel = key.wrapping_sub(*low);
                let target = if rel >= 0 && (rel as usize) < targets.len() {
                    targets[rel as usize]
                } else {
                    *default
                };
                pc = body.index_at(target).ok_or(VmError::InvalidJump(target))?;
                continue;
            }
            Op::Ret => return pop(&mut stack, offset),
            Op::RetVoid => return Ok(Value::Null),
        }
        pc += 1;
    }
}

enum InvokeKind {
    Virtual,
    Special,
    Static,
}

fn invoke(
    machine: &Machine,
    class: &Arc<ClassDef>,
    pool: &ConstantPool,
    idx: u16,
    kind: InvokeKind,
    stack: &mut Vec<Value>,
    offset: u32,
) -> VmResult<()> {
    let Some(PoolEntry::MethodRef {
        class: class_idx,
        name,
        params,
        ret,
    }) = pool.get(idx)
    else {
        return Err(VmError::RuntimeError(format!("bad method ref {idx}")));
    };
    let target_name = pool
        .class_name(*class_idx)
        .ok_or_else(|| VmError::RuntimeError("bad class ref in method ref".to_string()))?;
    let method_name = pool
        .utf8(*name)
        .ok_or_else(|| VmError::RuntimeError("bad method name".to_string()))?;
    let param_types: Vec<TypeRef> = params
        .iter()
        .map(|p| TypeRef::parse(pool.utf8(*p).unwrap_or_default()))
        .collect();
    let ret_name = pool
        .utf8(*ret)
        .ok_or_else(|| VmError::RuntimeError("bad return type".to_string()))?;
    let ret_type = TypeRef::parse(ret_name);

    let mut args = vec![Value::Null; param_types.len()];
    for slot in args.iter_mut().rev() {
        *slot = pop(stack, offset)?;
    }

    let result = match kind {
        InvokeKind::Virtual => {
            let receiver = pop(stack, offset)?;
            machine.call_virtual(receiver, method_name, &param_types, Some(&ret_type), &args)?
        }
        InvokeKind::Special => {
            let receiver = pop(stack, offset)?;
            let target = resolve_class(machine, class, target_name, false)?;
            if method_name == "<init>" {
                let def = machine.class(target);
                let (ctor_idx, _) =
                    def.find_ctor(&param_types)
                        .ok_or_else(|| VmError::NoSuchMethod {
                            class: def.name.clone(),
                            name: "<init>".to_string(),
                        })?;
                machine.invoke_ctor(target, ctor_idx, receiver, &args)?
            } else {
                machine.call_special(
                    target,
                    method_name,
                    &param_types,
                    Some(&ret_type),
                    receiver,
                    &args,
                )?
            }
        }
        InvokeKind::Static => {
            let target = resolve_class(machine, class, target_name, false)?;
            machine.call_static(target, method_name, &param_types, &args)?
        }
    };
    if ret_name != "void" {
        stack.push(result);
    }
    Ok(())
}

fn pop(stack: &mut Vec<Value>, offset: u32) -> VmResult<Value> {
    stack.pop().ok_or(VmError::StackUnderflow(offset))
}

fn store_local(locals: &mut [Value], slot: usize, value: Value) -> VmResult<()> {
    let cell = locals
        .get_mut(slot)
        .ok_or_else(|| VmError::RuntimeError(format!("local slot {slot} out of bounds")))?;
    *cell = value;
    Ok(())
}

fn int_of(value: Value) -> VmResult<i32> {
    value
        .as_int()
        .ok_or_else(|| VmError::TypeError("expected int operand".to_string()))
}

fn class_ref<'p>(pool: &'p ConstantPool, idx: u16) -> VmResult<&'p str> {
    pool.class_name(idx)
        .ok_or_else(|| VmError::RuntimeError(format!("bad class ref {idx}")))
}

/// Resolve a class name from the executing class's context.
///
/// A class may always reference itself by name; under legacy anonymous
/// hosting that self-reference is invalid as a cast target, which is why
/// generators cast through the host's name instead.
fn resolve_class(
    machine: &Machine,
    executing: &Arc<ClassDef>,
    name: &str,
    for_cast: bool,
) -> VmResult<ClassId> {
    if name == executing.name {
        if for_cast && executing.anonymous {
            return Err(VmError::ClassNotFound(name.to_string()));
        }
        return Ok(executing.id);
    }
    machine
        .find_class(executing.loader, name)
        .ok_or_else(|| VmError::ClassNotFound(name.to_string()))
}

fn instance_field(
    machine: &Machine,
    class: &Arc<ClassDef>,
    pool: &ConstantPool,
    idx: u16,
) -> VmResult<(ClassId, usize)> {
    let (declaring_name, field_name) = field_ref(pool, idx)?;
    let declaring = resolve_class(machine, class, declaring_name, false)?;
    let def = machine.class(declaring);
    let pos = def
        .fields
        .iter()
        .position(|f| f.name == field_name)
        .ok_or_else(|| VmError::NoSuchField {
            class: def.name.clone(),
            name: field_name.to_string(),
        })?;
    Ok((declaring, def.field_base + pos))
}

fn static_field(
    machine: &Machine,
    class: &Arc<ClassDef>,
    pool: &ConstantPool,
    idx: u16,
) -> VmResult<(ClassId, u16)> {
    let (declaring_name, field_name) = field_ref(pool, idx)?;
    let declaring = resolve_class(machine, class, declaring_name, false)?;
    let def = machine.class(declaring);
    let pos = def
        .static_fields
        .iter()
        .position(|f| f.name == field_name)
        .ok_or_else(|| VmError::NoSuchField {
            class: def.name.clone(),
            name: field_name.to_string(),
        })?;
    Ok((declaring, pos as u16))
}

fn field_ref<'p>(pool: &'p ConstantPool, idx: u16) -> VmResult<(&'p str, &'p str)> {
    let Some(PoolEntry::FieldRef { class, name, .. }) = pool.get(idx) else {
        return Err(VmError::RuntimeError(format!("bad field ref {idx}")));
    };
    let class_name = pool
        .class_name(*class)
        .ok_or_else(|| VmError::RuntimeError("bad class ref in field ref".to_string()))?;
    let field_name = pool
        .utf8(*name)
        .ok_or_else(|| VmError::RuntimeError("bad field name".to_string()))?;
    Ok((class_name, field_name))
}

fn resolve_handle(
    machine: &Machine,
    class: &Arc<ClassDef>,
    pool: &ConstantPool,
    idx: u16,
) -> VmResult<RawHandle> {
    let Some(PoolEntry::Handle {
        tag,
        class: class_idx,
        name,
        params,
    }) = pool.get(idx)
    else {
        return Err(VmError::RuntimeError(format!("bad handle ref {idx}")));
    };
    let target_name = pool
        .class_name(*class_idx)
        .ok_or_else(|| VmError::RuntimeError("bad class ref in handle".to_string()))?;
    let member_name = pool
        .utf8(*name)
        .ok_or_else(|| VmError::RuntimeError("bad member name in handle".to_string()))?;
    let param_types: Vec<TypeRef> = params
        .iter()
        .map(|p| TypeRef::parse(pool.utf8(*p).unwrap_or_default()))
        .collect();
    let target = resolve_class(machine, class, target_name, false)?;
    let def = machine.class(target);
    let kind = match tag {
        crate::image::HandleTag::Static => {
            let (idx, method) =
                def.find_method(member_name, &param_types, None)
                    .ok_or_else(|| VmError::NoSuchMethod {
                        class: def.name.clone(),
                        name: member_name.to_string(),
                    })?;
            if !method.modifiers.is_static() {
                return Err(VmError::TypeError(format!(
                    "{member_name} is not static"
                )));
            }
            HandleKind::Static(idx)
        }
        crate::image::HandleTag::Ctor => {
            let (idx, _) = def
                .find_ctor(&param_types)
                .ok_or_else(|| VmError::NoSuchMethod {
                    class: def.name.clone(),
                    name: "<init>".to_string(),
                })?;
            HandleKind::Ctor(idx)
        }
    };
    Ok(RawHandle {
        class: target,
        kind,
    })
}

fn runtime_type_name(machine: &Machine, value: Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Ref(_) => match machine.instance_class(value) {
            Some(id) => machine.class(id).name.clone(),
            None => "<dangling>".to_string(),
        },
        other => other
            .prim_kind()
            .map(|p| p.name().to_string())
            .unwrap_or_else(|| "<unknown>".to_string()),
    }
}

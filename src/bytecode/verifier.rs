//! Bytecode verification (part of C5) — a two-pass static check run once
//! when a module is loaded, before any process ever executes it: collect
//! valid jump targets, then walk every instruction checking operand
//! indices, jump targets, and coarse type compatibility on the abstract
//! type stack. This is deliberately conservative (it rejects programs a
//! real language front-end would never emit) rather than a full
//! dataflow-sound type system — its job is memory safety of the engine,
//! not soundness of the source language.

use std::collections::HashSet;
use crate::bytecode::{BytecodeProgram, TypeInfo, Bytecode};
use crate::types::EffectGrade;
use crate::error::{BytecodeError, BytecodeResult};

/// Bytecode verifier for ensuring safe execution
pub struct BytecodeVerifier {
    /// Type stack for verification
    type_stack: Vec<TypeInfo>,
    /// Local variable types
    locals_types: Vec<TypeInfo>,
    /// Maximum stack depth allowed
    max_stack_depth: usize,
    /// Maximum local variables allowed
    max_locals: usize,
    /// Allowed effect grades
    allowed_effects: HashSet<EffectGrade>,
    /// Jump target validation
    valid_jump_targets: HashSet<usize>,
}

impl BytecodeVerifier {
    /// Create a new bytecode verifier with default limits
    pub fn new() -> Self {
        let allowed_effects = [
            EffectGrade::Pure,
            EffectGrade::Read,
            EffectGrade::Write,
            EffectGrade::Memory,
            EffectGrade::Send,
            EffectGrade::Spawn,
            EffectGrade::IO,
        ]
        .into_iter()
        .collect();

        BytecodeVerifier {
            type_stack: Vec::new(),
            locals_types: Vec::new(),
            max_stack_depth: 1000,
            max_locals: 256,
            allowed_effects,
            valid_jump_targets: HashSet::new(),
        }
    }

    /// Create a verifier with custom limits
    pub fn with_limits(
        max_stack_depth: usize,
        max_locals: usize,
        allowed_effects: HashSet<EffectGrade>,
    ) -> Self {
        BytecodeVerifier {
            type_stack: Vec::new(),
            locals_types: Vec::new(),
            max_stack_depth,
            max_locals,
            allowed_effects,
            valid_jump_targets: HashSet::new(),
        }
    }

    /// Verify a bytecode program
    pub fn verify(&mut self, program: &BytecodeProgram) -> BytecodeResult<()> {
        self.type_stack.clear();
        self.locals_types.clear();
        self.valid_jump_targets.clear();

        self.collect_jump_targets(program)?;
        self.verify_instructions(program)?;

        Ok(())
    }

    /// Collect all valid jump targets
    fn collect_jump_targets(&mut self, program: &BytecodeProgram) -> BytecodeResult<()> {
        for (pc, _) in program.instructions.iter().enumerate() {
            self.valid_jump_targets.insert(pc);
        }
        for instruction in &program.instructions {
            if let Bytecode::Call(func_idx, _) = instruction {
                if let Some(function) = program.functions.get(*func_idx as usize) {
                    self.valid_jump_targets.insert(function.start_pc);
                }
            }
        }
        self.valid_jump_targets.insert(program.instructions.len());
        Ok(())
    }

    /// Verify all instructions in the program
    fn verify_instructions(&mut self, program: &BytecodeProgram) -> BytecodeResult<()> {
        for (pc, instruction) in program.instructions.iter().enumerate() {
            self.verify_instruction(instruction, pc, program)?;
        }
        Ok(())
    }

    /// Verify a single instruction
    fn verify_instruction(
        &mut self,
        instruction: &Bytecode,
        pc: usize,
        program: &BytecodeProgram,
    ) -> BytecodeResult<()> {
        if !self.allowed_effects.contains(&instruction.effect_grade()) {
            return Err(BytecodeError::Verification(format!(
                "effect grade {:?} not allowed at PC {}",
                instruction.effect_grade(),
                pc
            )));
        }

        match instruction {
            Bytecode::Const(idx, _) => {
                self.verify_constant_access(*idx, program)?;
                let value = &program.constants[*idx as usize];
                self.push_type(TypeInfo::from_value(value))?;
            }

            Bytecode::Load(idx, _) => {
                self.verify_local_access(*idx)?;
                let local_type = self.locals_types[*idx as usize].clone();
                self.push_type(local_type)?;
            }

            Bytecode::Store(idx, _) => {
                let value_type = self.pop_type()?;
                self.verify_local_store(*idx, value_type)?;
            }

            Bytecode::Add(_) | Bytecode::Sub(_) | Bytecode::Mul(_) | Bytecode::Div(_) | Bytecode::Mod(_) => {
                let b_type = self.pop_type()?;
                let a_type = self.pop_type()?;
                self.verify_arithmetic_operation(&a_type, &b_type)?;
                self.push_type(self.result_type_for_arithmetic(&a_type, &b_type))?;
            }

            Bytecode::BitAnd(_) | Bytecode::BitOr(_) | Bytecode::BitXor(_) => {
                let b_type = self.pop_type()?;
                let a_type = self.pop_type()?;
                self.verify_bitwise_operation(&a_type, &b_type)?;
                self.push_type(a_type)?;
            }

            Bytecode::Jump(target, _) => {
                self.verify_jump_target(*target)?;
            }

            Bytecode::JumpIf(target, _) | Bytecode::JumpIfNot(target, _) => {
                self.pop_type()?;
                self.verify_jump_target(*target)?;
            }

            Bytecode::Call(func_idx, _) => {
                self.verify_function_call(*func_idx, program)?;
            }

            Bytecode::Try(target, _) => {
                self.verify_jump_target(*target)?;
            }

            Bytecode::Throw(_) | Bytecode::Exit(_) => {
                self.pop_type()?;
            }

            Bytecode::SpawnProcess(func_idx, _) => {
                if *func_idx as usize >= program.functions.len() {
                    return Err(BytecodeError::Verification(format!(
                        "spawn_process target function {} out of bounds",
                        func_idx
                    )));
                }
                self.push_type(TypeInfo::Pid)?;
            }

            Bytecode::SendMessage(_) => {
                self.pop_type()?; // message
                self.pop_type()?; // recipient
            }

            Bytecode::Link(_) | Bytecode::Unlink(_) | Bytecode::Demonitor(_) => {
                self.pop_type()?;
            }

            Bytecode::Monitor(_) => {
                self.pop_type()?; // target pid
                self.push_type(TypeInfo::Unknown)?; // monitor ref
            }

            Bytecode::Self_(_) => {
                self.push_type(TypeInfo::Pid)?;
            }

            Bytecode::Alloc(_, _) => {
                self.push_type(TypeInfo::Unknown)?;
            }

            Bytecode::CallBif(_, arity, _) | Bytecode::CallNif(_, arity, _) => {
                for _ in 0..*arity {
                    self.pop_type()?;
                }
                self.push_type(TypeInfo::Unknown)?;
            }

            _ => {
                self.verify_basic_instruction(instruction)?;
            }
        }

        if self.type_stack.len() > self.max_stack_depth {
            return Err(BytecodeError::Verification(format!(
                "stack depth {} exceeds maximum {}",
                self.type_stack.len(),
                self.max_stack_depth
            )));
        }

        Ok(())
    }

    fn push_type(&mut self, type_info: TypeInfo) -> BytecodeResult<()> {
        if self.type_stack.len() >= self.max_stack_depth {
            return Err(BytecodeError::Verification("stack overflow".to_string()));
        }
        self.type_stack.push(type_info);
        Ok(())
    }

    fn pop_type(&mut self) -> BytecodeResult<TypeInfo> {
        self.type_stack.pop().ok_or_else(|| BytecodeError::Verification("stack underflow".to_string()))
    }

    fn verify_constant_access(&self, idx: u32, program: &BytecodeProgram) -> BytecodeResult<()> {
        if idx as usize >= program.constants.len() {
            return Err(BytecodeError::Verification(format!("constant index {} out of bounds", idx)));
        }
        Ok(())
    }

    fn verify_local_access(&self, idx: u32) -> BytecodeResult<()> {
        if idx as usize >= self.locals_types.len() {
            return Err(BytecodeError::Verification(format!("local variable index {} out of bounds", idx)));
        }
        Ok(())
    }

    fn verify_local_store(&mut self, idx: u32, value_type: TypeInfo) -> BytecodeResult<()> {
        while self.locals_types.len() <= idx as usize {
            if self.locals_types.len() >= self.max_locals {
                return Err(BytecodeError::Verification(format!("too many local variables (max: {})", self.max_locals)));
            }
            self.locals_types.push(TypeInfo::Unknown);
        }
        self.locals_types[idx as usize] = value_type;
        Ok(())
    }

    fn verify_arithmetic_operation(&self, a: &TypeInfo, b: &TypeInfo) -> BytecodeResult<()> {
        match (a, b) {
            (TypeInfo::Int, TypeInfo::Int)
            | (TypeInfo::Float, TypeInfo::Float)
            | (TypeInfo::Int, TypeInfo::Float)
            | (TypeInfo::Float, TypeInfo::Int)
            | (TypeInfo::Unknown, _)
            | (_, TypeInfo::Unknown)
            | (TypeInfo::TypeVar(_), _)
            | (_, TypeInfo::TypeVar(_)) => Ok(()),
            _ => Err(BytecodeError::Verification(format!(
                "invalid arithmetic operation between {:?} and {:?}", a, b
            ))),
        }
    }

    fn result_type_for_arithmetic(&self, a: &TypeInfo, b: &TypeInfo) -> TypeInfo {
        match (a, b) {
            (TypeInfo::Float, _) | (_, TypeInfo::Float) => TypeInfo::Float,
            (TypeInfo::Unknown, _) | (_, TypeInfo::Unknown) => TypeInfo::Unknown,
            _ => TypeInfo::Int,
        }
    }

    fn verify_bitwise_operation(&self, a: &TypeInfo, b: &TypeInfo) -> BytecodeResult<()> {
        match (a, b) {
            (TypeInfo::Int, TypeInfo::Int) | (TypeInfo::Unknown, _) | (_, TypeInfo::Unknown) => Ok(()),
            _ => Err(BytecodeError::Verification(format!(
                "invalid bitwise operation between {:?} and {:?}", a, b
            ))),
        }
    }

    fn verify_jump_target(&self, target: u32) -> BytecodeResult<()> {
        if !self.valid_jump_targets.contains(&(target as usize)) {
            return Err(BytecodeError::InvalidBranchTarget(target));
        }
        Ok(())
    }

    fn verify_function_call(&mut self, func_idx: u32, program: &BytecodeProgram) -> BytecodeResult<()> {
        if func_idx as usize >= program.functions.len() {
            return Err(BytecodeError::Verification(format!("function index {} out of bounds", func_idx)));
        }
        self.push_type(TypeInfo::Unknown)?;
        Ok(())
    }

    /// Basic validation for instructions not specifically modeled above:
    /// just checks the effect grade, already done by the caller.
    fn verify_basic_instruction(&mut self, _instruction: &Bytecode) -> BytecodeResult<()> {
        Ok(())
    }
}

impl Default for BytecodeVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeProgram, Value};

    #[test]
    fn test_type_compatibility() {
        assert!(TypeInfo::Int.is_compatible(&TypeInfo::Int));
        assert!(TypeInfo::Unknown.is_compatible(&TypeInfo::String));
        assert!(!TypeInfo::String.is_compatible(&TypeInfo::Int));
    }

    #[test]
    fn test_verifier_empty_program() {
        let mut verifier = BytecodeVerifier::new();
        let program = BytecodeProgram::new("test".to_string());
        assert!(verifier.verify(&program).is_ok());
    }

    #[test]
    fn test_verifier_rejects_bad_jump() {
        let mut verifier = BytecodeVerifier::new();
        let mut program = BytecodeProgram::new("test".to_string());
        program.add_instruction(Bytecode::Jump(999, EffectGrade::Pure));
        assert!(verifier.verify(&program).is_err());
    }

    #[test]
    fn test_verifier_accepts_arithmetic() {
        let mut verifier = BytecodeVerifier::new();
        let mut program = BytecodeProgram::new("test".to_string());
        let a = program.add_constant(Value::Int(1));
        let b = program.add_constant(Value::Int(2));
        program.add_instruction(Bytecode::Const(a, EffectGrade::Pure));
        program.add_instruction(Bytecode::Const(b, EffectGrade::Pure));
        program.add_instruction(Bytecode::Add(EffectGrade::Pure));
        program.add_instruction(Bytecode::Ret(EffectGrade::Pure));
        assert!(verifier.verify(&program).is_ok());
    }

    #[test]
    fn test_stack_operations() {
        let mut verifier = BytecodeVerifier::new();
        verifier.push_type(TypeInfo::Int).unwrap();
        let popped = verifier.pop_type().unwrap();
        assert_eq!(popped, TypeInfo::Int);
        assert!(verifier.pop_type().is_err());
    }
}

//! Opcode dispatch and the script/engine boundary.
//!
//! An execution context borrows the kernel, the owning unit's (detached)
//! environment and one thread, and runs that thread until it finishes,
//! blocks or errors. The free functions at the bottom are the per-tick
//! scheduler and the synchronous-query entry point.

use crate::game::angle::{self, TaAngle};
use crate::game::cob::script::{CobValueId, OpCode};
use crate::game::cob::{BlockedStatus, CobEnvironment, CobThread, ThreadStatus};
use crate::game::events::{GameEvent, SfxType};
use crate::game::math::{sim_scalar_from_fixed, sim_scalar_to_fixed, SimScalar};
use crate::game::simulation::GameSimulation;
use crate::game::unit::UnitId;
use crate::game::unit_mesh::SimAxis;
use crate::game::{SimError, SIM_MILLISECONDS_PER_TICK};

/// Backstop against scripts that loop without ever blocking. Authored
/// scripts run a handful of instructions per tick; hitting this means the
/// content is broken.
const INSTRUCTION_BUDGET: u32 = 1_000_000;

const COB_TRUE: i32 = 1;
const COB_FALSE: i32 = 0;

pub struct CobExecutionContext<'a> {
    sim: &'a mut GameSimulation,
    env: &'a mut CobEnvironment,
    thread: &'a mut CobThread,
    unit_id: UnitId,
    /// Index of the running thread within the environment, when scheduled.
    /// Synchronous query threads have none.
    thread_index: Option<usize>,
}

impl<'a> CobExecutionContext<'a> {
    pub fn new(
        sim: &'a mut GameSimulation,
        env: &'a mut CobEnvironment,
        thread: &'a mut CobThread,
        unit_id: UnitId,
        thread_index: Option<usize>,
    ) -> Self {
        Self {
            sim,
            env,
            thread,
            unit_id,
            thread_index,
        }
    }

    /// Runs the thread until it returns from its outermost frame or suspends.
    pub fn execute(&mut self) -> Result<ThreadStatus, SimError> {
        let mut budget = INSTRUCTION_BUDGET;
        while !self.thread.call_stack.is_empty() {
            budget = budget.checked_sub(1).ok_or(SimError::RunawayScript)?;

            let address = self.frame().instruction_index;
            let word = self.next_instruction();
            let op = OpCode::from_word(word).ok_or(SimError::UnknownOpcode {
                opcode: word,
                address,
            })?;

            match op {
                OpCode::Rand => self.random_number(),

                OpCode::Add => self.binary_op(|a, b| a.wrapping_add(b)),
                OpCode::Sub => self.binary_op(|a, b| a.wrapping_sub(b)),
                OpCode::Mul => self.binary_op(|a, b| a.wrapping_mul(b)),
                OpCode::Div => self.binary_op(|a, b| if b == 0 { 0 } else { a.wrapping_div(b) }),

                OpCode::SetLess => self.compare(|a, b| a < b),
                OpCode::SetLessOrEqual => self.compare(|a, b| a <= b),
                OpCode::SetEqual => self.compare(|a, b| a == b),
                OpCode::SetNotEqual => self.compare(|a, b| a != b),
                OpCode::SetGreater => self.compare(|a, b| a > b),
                OpCode::SetGreaterOrEqual => self.compare(|a, b| a >= b),

                OpCode::Jump => {
                    let offset = self.next_instruction() as usize;
                    self.frame_mut().instruction_index = offset;
                }
                OpCode::JumpIfZero => {
                    let offset = self.next_instruction() as usize;
                    if self.pop() == 0 {
                        self.frame_mut().instruction_index = offset;
                    }
                }

                OpCode::LogicalAnd => self.compare(|a, b| a != 0 && b != 0),
                OpCode::LogicalOr => self.compare(|a, b| a != 0 || b != 0),
                OpCode::LogicalXor => self.compare(|a, b| (a != 0) != (b != 0)),
                OpCode::LogicalNot => {
                    let v = self.pop();
                    self.push(if v == 0 { COB_TRUE } else { COB_FALSE });
                }

                OpCode::BitwiseAnd => self.binary_op(|a, b| a & b),
                OpCode::BitwiseOr => self.binary_op(|a, b| a | b),
                OpCode::BitwiseXor => self.binary_op(|a, b| a ^ b),
                OpCode::BitwiseNot => {
                    let v = self.pop();
                    self.push(!v);
                }

                OpCode::Move => self.move_piece()?,
                OpCode::MoveNow => self.move_piece_now()?,
                OpCode::Turn => self.turn_piece()?,
                OpCode::TurnNow => self.turn_piece_now()?,
                OpCode::Spin => self.spin_piece()?,
                OpCode::StopSpin => self.stop_spin_piece()?,
                OpCode::Show => self.set_piece_visible(true)?,
                OpCode::Hide => self.set_piece_visible(false)?,
                OpCode::Shade => self.set_piece_shaded(true)?,
                OpCode::DontShade => self.set_piece_shaded(false)?,
                OpCode::Cache | OpCode::DontCache => {
                    // Object caching does not exist in this engine.
                    self.next_instruction();
                }
                OpCode::Explode => self.explode()?,
                OpCode::EmitSfx => self.emit_sfx()?,
                OpCode::PlaySound => {
                    // Sound playback lives outside the simulation.
                    self.next_instruction();
                    self.pop();
                }
                OpCode::AttachUnit => {
                    // Unit transport is not implemented.
                    self.pop();
                    self.pop();
                }
                OpCode::DropUnit => {
                    self.pop();
                }

                OpCode::WaitForMove => {
                    let piece = self.next_instruction() as usize;
                    let axis = self.next_instruction_as_axis()?;
                    return Ok(ThreadStatus::Blocked(BlockedStatus::Move { piece, axis }));
                }
                OpCode::WaitForTurn => {
                    let piece = self.next_instruction() as usize;
                    let axis = self.next_instruction_as_axis()?;
                    return Ok(ThreadStatus::Blocked(BlockedStatus::Turn { piece, axis }));
                }
                OpCode::Sleep => {
                    let duration_ms = self.pop();
                    let ticks = duration_ms.max(0) as u32 / SIM_MILLISECONDS_PER_TICK;
                    return Ok(ThreadStatus::Sleeping(self.sim.game_time + ticks));
                }

                OpCode::CallScript => self.call_script(),
                OpCode::StartScript => self.start_script(),
                OpCode::Return => self.return_from_script(),

                OpCode::Signal => {
                    let signal = self.pop() as u32;
                    self.env.send_signal(signal, self.thread_index);
                }
                OpCode::SetSignalMask => {
                    self.thread.signal_mask = self.pop() as u32;
                }

                OpCode::CreateLocalVar => {
                    let frame = self.frame_mut();
                    if frame.local_count == frame.locals.len() {
                        frame.locals.push(0);
                    }
                    frame.local_count += 1;
                }
                OpCode::PushConstant => {
                    let constant = self.next_instruction() as i32;
                    self.push(constant);
                }
                OpCode::PushLocalVar => {
                    let id = self.next_instruction() as usize;
                    let value = self.frame().locals.get(id).copied().unwrap_or(0);
                    self.push(value);
                }
                OpCode::PopLocalVar => {
                    let id = self.next_instruction() as usize;
                    let value = self.pop();
                    let frame = self.frame_mut();
                    if id >= frame.locals.len() {
                        frame.locals.resize(id + 1, 0);
                    }
                    frame.locals[id] = value;
                }
                OpCode::PushStatic => {
                    let id = self.next_instruction() as usize;
                    self.push(self.env.get_static(id));
                }
                OpCode::PopStatic => {
                    let id = self.next_instruction() as usize;
                    let value = self.pop();
                    self.env.set_static(id, value);
                }
                OpCode::PopStack => {
                    self.pop();
                }

                OpCode::GetValue => {
                    let value_id = self.pop_value_id()?;
                    let v = self.get_value(value_id, 0, 0, 0, 0)?;
                    self.push(v);
                }
                OpCode::GetValueWithArgs => {
                    let arg4 = self.pop();
                    let arg3 = self.pop();
                    let arg2 = self.pop();
                    let arg1 = self.pop();
                    let value_id = self.pop_value_id()?;
                    let v = self.get_value(value_id, arg1, arg2, arg3, arg4)?;
                    self.push(v);
                }
                OpCode::SetValue => {
                    let value = self.pop();
                    let value_id = self.pop_value_id()?;
                    self.set_value(value_id, value)?;
                }
            }
        }

        Ok(ThreadStatus::Finished)
    }

    // ------------------------------------------------------------------
    // Stack and instruction-stream primitives
    // ------------------------------------------------------------------

    fn frame(&self) -> &crate::game::cob::CobFrame {
        self.thread.call_stack.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut crate::game::cob::CobFrame {
        self.thread.call_stack.last_mut().expect("no active frame")
    }

    fn next_instruction(&mut self) -> u32 {
        let frame = self.thread.call_stack.last_mut().expect("no active frame");
        let word = self
            .env
            .script
            .instructions
            .get(frame.instruction_index)
            .copied()
            .unwrap_or(0);
        frame.instruction_index += 1;
        word
    }

    fn next_instruction_as_axis(&mut self) -> Result<SimAxis, SimError> {
        match self.next_instruction() {
            0 => Ok(SimAxis::X),
            1 => Ok(SimAxis::Y),
            2 => Ok(SimAxis::Z),
            v => Err(SimError::InvalidAxis(v)),
        }
    }

    /// Popping an empty stack yields 0: some authored scripts pop more than
    /// they push and the original engine tolerates it.
    fn pop(&mut self) -> i32 {
        self.thread.stack.pop().unwrap_or(0)
    }

    fn push(&mut self, value: i32) {
        self.thread.stack.push(value);
    }

    fn binary_op(&mut self, f: impl FnOnce(i32, i32) -> i32) {
        let b = self.pop();
        let a = self.pop();
        self.push(f(a, b));
    }

    fn compare(&mut self, f: impl FnOnce(i32, i32) -> bool) {
        let b = self.pop();
        let a = self.pop();
        self.push(if f(a, b) { COB_TRUE } else { COB_FALSE });
    }

    /// Q16.16 position off the operand stack.
    fn pop_position(&mut self) -> SimScalar {
        sim_scalar_from_fixed(self.pop())
    }

    /// Unsigned Q16.16 speed, world units per second.
    fn pop_speed(&mut self) -> SimScalar {
        SimScalar::from_bits(self.pop() as u32 as i64)
    }

    /// Unsigned angular speed in angle units per second.
    fn pop_angular_speed(&mut self) -> SimScalar {
        SimScalar::from_num(self.pop() as u32)
    }

    fn pop_signed_angular_speed(&mut self) -> SimScalar {
        SimScalar::from_num(self.pop())
    }

    fn pop_angle(&mut self) -> TaAngle {
        TaAngle { value: self.pop() }
    }

    fn pop_value_id(&mut self) -> Result<CobValueId, SimError> {
        let raw = self.pop();
        CobValueId::from_value(raw).ok_or(SimError::UnknownCobValue(raw as u32))
    }

    fn piece_name(&self, piece: usize) -> Result<String, SimError> {
        self.env
            .script
            .piece_name(piece)
            .cloned()
            .ok_or_else(|| SimError::UnknownPiece {
                unit_type: self.unit_type(),
                piece: format!("<piece {}>", piece),
            })
    }

    fn unit_type(&self) -> String {
        self.sim
            .units
            .get(self.unit_id)
            .map(|u| u.unit_type.clone())
            .unwrap_or_default()
    }

    fn unit_mut(&mut self) -> Option<&mut crate::game::unit::UnitState> {
        self.sim.units.get_mut(self.unit_id)
    }

    // ------------------------------------------------------------------
    // Piece motion
    // ------------------------------------------------------------------

    fn move_piece(&mut self) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let axis = self.next_instruction_as_axis()?;
        let mut position = self.pop_position();
        // Authored scripts use a left-handed coordinate system.
        if axis == SimAxis::X {
            position = -position;
        }
        let speed = self.pop_speed();
        let name = self.piece_name(piece)?;
        if let Some(unit) = self.unit_mut() {
            unit.move_piece(&name, axis, position, speed)?;
        }
        Ok(())
    }

    fn move_piece_now(&mut self) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let axis = self.next_instruction_as_axis()?;
        let mut position = self.pop_position();
        if axis == SimAxis::X {
            position = -position;
        }
        let name = self.piece_name(piece)?;
        if let Some(unit) = self.unit_mut() {
            unit.move_piece_now(&name, axis, position)?;
        }
        Ok(())
    }

    fn turn_piece(&mut self) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let axis = self.next_instruction_as_axis()?;
        let mut target = self.pop_angle();
        // Authored scripts use a left-handed coordinate system.
        if axis == SimAxis::Z {
            target = TaAngle {
                value: -target.value,
            };
        }
        let speed = self.pop_angular_speed();
        let name = self.piece_name(piece)?;
        if let Some(unit) = self.unit_mut() {
            unit.turn_piece(&name, axis, target.to_sim_angle(), speed)?;
        }
        Ok(())
    }

    fn turn_piece_now(&mut self) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let axis = self.next_instruction_as_axis()?;
        let mut target = self.pop_angle();
        if axis == SimAxis::Z {
            target = TaAngle {
                value: -target.value,
            };
        }
        let name = self.piece_name(piece)?;
        if let Some(unit) = self.unit_mut() {
            unit.turn_piece_now(&name, axis, target.to_sim_angle())?;
        }
        Ok(())
    }

    fn spin_piece(&mut self) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let axis = self.next_instruction_as_axis()?;
        let target_speed = self.pop_signed_angular_speed();
        let acceleration = self.pop_angular_speed();
        let name = self.piece_name(piece)?;
        if let Some(unit) = self.unit_mut() {
            unit.spin_piece(&name, axis, target_speed, acceleration)?;
        }
        Ok(())
    }

    fn stop_spin_piece(&mut self) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let axis = self.next_instruction_as_axis()?;
        let deceleration = self.pop_angular_speed();
        let name = self.piece_name(piece)?;
        if let Some(unit) = self.unit_mut() {
            unit.stop_spin_piece(&name, axis, deceleration)?;
        }
        Ok(())
    }

    fn set_piece_visible(&mut self, visible: bool) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let name = self.piece_name(piece)?;
        if let Some(unit) = self.unit_mut() {
            if let Some(p) = unit.find_piece_mut(&name) {
                p.visible = visible;
            }
        }
        Ok(())
    }

    fn set_piece_shaded(&mut self, shaded: bool) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let name = self.piece_name(piece)?;
        if let Some(unit) = self.unit_mut() {
            if let Some(p) = unit.find_piece_mut(&name) {
                p.shaded = shaded;
            }
        }
        Ok(())
    }

    fn explode(&mut self) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let _explosion_type = self.pop();
        let name = self.piece_name(piece)?;
        self.sim.events.push(GameEvent::EmitParticleFromPiece {
            sfx_type: SfxType::BlackSmoke,
            unit_id: self.unit_id,
            piece_name: name,
        });
        Ok(())
    }

    fn emit_sfx(&mut self) -> Result<(), SimError> {
        let piece = self.next_instruction() as usize;
        let sfx_code = self.pop();
        let name = self.piece_name(piece)?;
        let sfx_type = match sfx_code {
            1 => Some(SfxType::LightSmoke),
            2 => Some(SfxType::BlackSmoke),
            3 => Some(SfxType::Wake1),
            _ => None,
        };
        if let Some(sfx_type) = sfx_type {
            self.sim.events.push(GameEvent::EmitParticleFromPiece {
                sfx_type,
                unit_id: self.unit_id,
                piece_name: name,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    fn call_script(&mut self) {
        let function_id = self.next_instruction() as usize;
        let param_count = self.next_instruction() as usize;
        let mut params = vec![0; param_count];
        for p in params.iter_mut() {
            *p = self.pop();
        }
        if let Some(function) = self.env.script.functions.get(function_id) {
            self.thread
                .call_stack
                .push(crate::game::cob::CobFrame::new(function.address, params));
        }
    }

    fn start_script(&mut self) {
        let function_id = self.next_instruction() as usize;
        let param_count = self.next_instruction() as usize;
        let mut params = vec![0; param_count];
        for p in params.iter_mut() {
            *p = self.pop();
        }
        if function_id < self.env.script.functions.len() {
            self.env
                .create_thread_by_id(function_id, params, self.thread.signal_mask);
        }
    }

    fn return_from_script(&mut self) {
        self.thread.return_value = self.pop();
        if let Some(frame) = self.thread.call_stack.pop() {
            self.thread.return_locals = frame.locals;
        }
    }

    fn random_number(&mut self) {
        let high = self.pop();
        let low = self.pop();
        let value = if high <= low {
            low
        } else {
            self.sim.rng.next_in_range(low.max(0) as u32, high as u32) as i32
        };
        self.push(value);
    }

    // ------------------------------------------------------------------
    // Engine values
    // ------------------------------------------------------------------

    fn get_value(
        &mut self,
        value_id: CobValueId,
        arg1: i32,
        arg2: i32,
        arg3: i32,
        arg4: i32,
    ) -> Result<i32, SimError> {
        let _ = (arg3, arg4);
        match value_id {
            CobValueId::Activation => {
                let unit = self.sim.get_unit(self.unit_id)?;
                Ok(if unit.activated { COB_TRUE } else { COB_FALSE })
            }
            CobValueId::StandingFireOrders => Ok(0),
            CobValueId::StandingMoveOrders => Ok(0),
            CobValueId::Health => {
                let unit = self.sim.get_unit(self.unit_id)?;
                let definition = self.sim.get_unit_definition(&unit.unit_type)?;
                if definition.max_hit_points == 0 {
                    return Ok(0);
                }
                Ok(((unit.hit_points as u64 * 100) / definition.max_hit_points as u64) as i32)
            }
            CobValueId::InBuildStance => {
                let unit = self.sim.get_unit(self.unit_id)?;
                Ok(if unit.in_build_stance {
                    COB_TRUE
                } else {
                    COB_FALSE
                })
            }
            CobValueId::Busy => Ok(COB_FALSE),
            CobValueId::PieceXz => {
                let name = self.piece_name(arg1 as usize)?;
                let pos = self.sim.get_unit_piece_position(self.unit_id, &name)?;
                Ok(angle::pack_coords(pos.x, pos.z))
            }
            CobValueId::PieceY => {
                let name = self.piece_name(arg1 as usize)?;
                let pos = self.sim.get_unit_piece_position(self.unit_id, &name)?;
                Ok(sim_scalar_to_fixed(pos.y))
            }
            CobValueId::UnitXz => {
                match self.sim.try_get_unit_by_cob_id(arg1) {
                    Some(unit) => Ok(angle::pack_coords(unit.position.x, unit.position.z)),
                    None => Ok(0),
                }
            }
            CobValueId::UnitY => match self.sim.try_get_unit_by_cob_id(arg1) {
                Some(unit) => Ok(sim_scalar_to_fixed(unit.position.y)),
                None => Ok(0),
            },
            CobValueId::UnitHeight => match self.sim.try_get_unit_by_cob_id(arg1) {
                Some(unit) => {
                    let definition = self.sim.get_unit_definition(&unit.unit_type)?;
                    let model = self.sim.get_model_definition(&definition.object_name)?;
                    Ok(sim_scalar_to_fixed(model.height))
                }
                None => Ok(0),
            },
            CobValueId::XzAtan => {
                let (x, z) = angle::unpack_coords(arg1);
                let unit = self.sim.get_unit(self.unit_id)?;
                let result = angle::atan2(z, x) - unit.rotation;
                Ok(result.to_ta_angle().value)
            }
            CobValueId::XzHypot => {
                let (x, z) = angle::unpack_coords(arg1);
                Ok(sim_scalar_to_fixed(hypot(x, z)))
            }
            CobValueId::Atan => {
                let result = angle::atan2(SimScalar::from_num(arg1), SimScalar::from_num(arg2));
                Ok(result.to_ta_angle().value)
            }
            CobValueId::Hypot => {
                let a = sim_scalar_from_fixed(arg1);
                let b = sim_scalar_from_fixed(arg2);
                Ok(sim_scalar_to_fixed(hypot(a, b)))
            }
            CobValueId::GroundHeight => {
                let (x, z) = angle::unpack_coords(arg1);
                Ok(sim_scalar_to_fixed(self.sim.terrain.get_height_at(x, z)))
            }
            CobValueId::BuildPercentLeft => Ok(0),
            CobValueId::YardOpen => {
                let unit = self.sim.get_unit(self.unit_id)?;
                Ok(if unit.yard_open { COB_TRUE } else { COB_FALSE })
            }
            CobValueId::BuggerOff => Ok(COB_FALSE),
            CobValueId::Armored => Ok(COB_FALSE),
            CobValueId::VeteranLevel => Ok(0),
            // Simulation state is never allowed to diverge between
            // participants, so every unit is "on this computer".
            CobValueId::UnitIsOnThisComp => Ok(COB_TRUE),
            CobValueId::MinId => Ok(0),
            CobValueId::MaxId => Ok(self.sim.units.slot_count() as i32 - 1),
            CobValueId::MyId => Ok(self.unit_id.index as i32),
            CobValueId::UnitTeam => match self.sim.try_get_unit_by_cob_id(arg1) {
                Some(unit) => Ok(unit.owner.0 as i32),
                None => Ok(0),
            },
            CobValueId::UnitBuildPercentLeft => Ok(0),
            CobValueId::UnitAllied => {
                let owner = self.sim.get_unit(self.unit_id)?.owner;
                match self.sim.try_get_unit_by_cob_id(arg1) {
                    Some(unit) => Ok(if unit.is_owned_by(owner) {
                        COB_TRUE
                    } else {
                        COB_FALSE
                    }),
                    None => Ok(COB_FALSE),
                }
            }
        }
    }

    fn set_value(&mut self, value_id: CobValueId, value: i32) -> Result<(), SimError> {
        match value_id {
            CobValueId::InBuildStance => {
                self.sim.set_build_stance(self.unit_id, value != 0);
                Ok(())
            }
            CobValueId::YardOpen => {
                self.sim.set_yard_open(self.unit_id, value != 0);
                Ok(())
            }
            CobValueId::BuggerOff => {
                self.sim.set_bugger_off(self.unit_id, value != 0);
                Ok(())
            }
            // Accepted and ignored, as the original engine does.
            CobValueId::Activation
            | CobValueId::StandingMoveOrders
            | CobValueId::StandingFireOrders
            | CobValueId::Busy
            | CobValueId::Armored => Ok(()),
            other => Err(SimError::UnsettableCobValue(other as u32)),
        }
    }
}

fn hypot(a: SimScalar, b: SimScalar) -> SimScalar {
    (a * a + b * b).sqrt()
}

// ============================================================================
// Scheduling
// ============================================================================

/// Runs a unit's script threads for this tick: wakes satisfied waiters, then
/// drains the ready queue in FIFO order. Newly spawned threads run in the
/// same drain.
pub fn run_unit_cob_scripts(sim: &mut GameSimulation, unit_id: UnitId) -> Result<(), SimError> {
    let mut env = match sim.units.get_mut(unit_id) {
        Some(unit) => std::mem::take(&mut unit.cob_env),
        None => return Ok(()),
    };

    let result = run_scripts_inner(sim, &mut env, unit_id);

    if let Some(unit) = sim.units.get_mut(unit_id) {
        unit.cob_env = env;
    }
    result
}

fn run_scripts_inner(
    sim: &mut GameSimulation,
    env: &mut CobEnvironment,
    unit_id: UnitId,
) -> Result<(), SimError> {
    // Threads that finished last tick and were never reaped are gone now.
    for index in env.finished_queue.drain(..) {
        env.threads[index] = None;
    }

    // Wake sleepers whose time has come.
    let now = sim.game_time;
    let mut i = 0;
    while i < env.sleeping_queue.len() {
        if env.sleeping_queue[i].0 <= now {
            let (_, index) = env.sleeping_queue.remove(i);
            env.ready_queue.push_back(index);
        } else {
            i += 1;
        }
    }

    // Wake threads whose awaited piece operation has completed.
    let mut i = 0;
    while i < env.blocked_queue.len() {
        let (status, index) = env.blocked_queue[i];
        let satisfied = match sim.units.get(unit_id) {
            Some(unit) => match status {
                BlockedStatus::Move { piece, axis } => match env.script.piece_name(piece) {
                    Some(name) => !unit.is_move_in_progress(name, axis),
                    None => true,
                },
                BlockedStatus::Turn { piece, axis } => match env.script.piece_name(piece) {
                    Some(name) => !unit.is_turn_in_progress(name, axis),
                    None => true,
                },
            },
            None => true,
        };
        if satisfied {
            env.blocked_queue.remove(i);
            env.ready_queue.push_back(index);
        } else {
            i += 1;
        }
    }

    // Drain ready threads.
    while let Some(index) = env.ready_queue.pop_front() {
        let Some(mut thread) = env.threads.get_mut(index).and_then(Option::take) else {
            continue;
        };
        let status =
            CobExecutionContext::new(sim, env, &mut thread, unit_id, Some(index)).execute()?;
        env.threads[index] = Some(thread);
        match status {
            ThreadStatus::Finished => env.finished_queue.push(index),
            ThreadStatus::Blocked(blocked) => env.blocked_queue.push((blocked, index)),
            ThreadStatus::Sleeping(wake_time) => env.sleeping_queue.push((wake_time, index)),
        }
    }

    Ok(())
}

/// Runs a script function synchronously to completion and returns its first
/// out-parameter (`returnLocals[0]`). Returns `None` if the script does not
/// export the function. Blocking inside a synchronous query is a hard error.
pub fn run_cob_query(
    sim: &mut GameSimulation,
    unit_id: UnitId,
    name: &str,
) -> Result<Option<i32>, SimError> {
    let mut env = match sim.units.get_mut(unit_id) {
        Some(unit) => std::mem::take(&mut unit.cob_env),
        None => return Ok(None),
    };

    let result = (|| {
        let Some(mut thread) = env.create_non_scheduled_thread(name, vec![0]) else {
            return Ok(None);
        };
        let status =
            CobExecutionContext::new(sim, &mut env, &mut thread, unit_id, None).execute()?;
        if status != ThreadStatus::Finished {
            return Err(SimError::BlockedSynchronousQuery {
                script: name.to_string(),
            });
        }
        Ok(Some(thread.return_locals.first().copied().unwrap_or(0)))
    })();

    if let Some(unit) = sim.units.get_mut(unit_id) {
        unit.cob_env = env;
    }
    result
}
